use core::future::Future;
use core::time::Duration;

use log::debug;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::prelude::*;
use crate::util::clock::Clock;
use crate::{Error, Result};

/// Runs one-shot tasks at absolute wall-clock deadlines.
///
/// The delay is computed from the clock when the task is armed, so deadlines
/// loaded from storage after a restart fire at the right time.
pub(crate) struct Scheduler {
    handle: Handle,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("registry needs a tokio runtime: {}", e)))?;
        Ok(Scheduler { handle, clock })
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_secs()
    }

    pub(crate) fn schedule<F>(&self, deadline: u64, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = deadline.saturating_sub(self.now());
        debug!("arming timer for {} in {}s", deadline, delay);
        self.handle.spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            task.await
        })
    }
}
