//! Accepts payment channels over TCP and settles them to a payout address.
//!
//! Broadcasts are appended to `<datadir>/outbox.txt` for an external relay.

use std::env;
use std::net::SocketAddr;
use std::process::exit;
use std::str::FromStr as _;

use anyhow::Context as _;
use tracing::{error, info, warn, Level};

use payment_channel::bitcoin::Amount;
use payment_channel::channel::ChannelId;
use payment_channel::persist::{load_extension, ChannelStore};
use payment_channel::prelude::*;
use payment_channel::util::clock::StandardClock;
use paychan_handler::CloseReason;
use paychan_net::broadcast::{FileBroadcaster, PayoutWallet};
use paychan_net::config::{parse_args_and_config_from, PaychandArgs};
use paychan_net::observability::init_tracing_subscriber;
use paychan_net::store::FileStore;
use paychan_net::{
    HandlerFactory, PaymentChannelServerListener, ServerConnectionEventHandler, SessionHandle,
};

/// Logs every session event
struct LoggingHandler {
    addr: SocketAddr,
}

impl SendSync for LoggingHandler {}

impl ServerConnectionEventHandler for LoggingHandler {
    fn channel_open(&self, id: ChannelId) {
        info!(peer = %self.addr, "channel {} open", id);
    }

    fn payment_increase(&self, by: Amount, to: Amount) {
        info!(peer = %self.addr, "received {} for a total of {}", by, to);
    }

    fn channel_closed(&self, reason: CloseReason) {
        if reason.is_error() {
            warn!(peer = %self.addr, "session ended: {}", reason);
        } else {
            info!(peer = %self.addr, "session ended: {}", reason);
        }
    }
}

struct LoggingHandlerFactory;

impl SendSync for LoggingHandlerFactory {}

impl HandlerFactory for LoggingHandlerFactory {
    fn on_new_connection(
        &self,
        addr: SocketAddr,
        _session: SessionHandle,
    ) -> Option<Arc<dyn ServerConnectionEventHandler>> {
        info!("connection from {}", addr);
        Some(Arc::new(LoggingHandler { addr }))
    }
}

fn main() {
    let env_args = env::args().collect::<Vec<_>>();
    let args = parse_args_and_config_from(&env_args).unwrap_or_else(|e| e.exit());

    if let Err(e) = std::fs::create_dir_all(&args.datadir) {
        eprintln!("cannot create {}: {}", args.datadir.display(), e);
        exit(1);
    }
    let level = Level::from_str(&args.log_level).unwrap_or(Level::INFO);
    let _guard = match init_tracing_subscriber(&args.datadir, "paychand", level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("cannot initialize logging: {}", e);
            exit(1);
        }
    };

    if let Err(e) = start(args) {
        error!("paychand failed: {:#}", e);
        exit(1);
    }
}

#[tokio::main(worker_threads = 2)]
async fn start(args: PaychandArgs) -> anyhow::Result<()> {
    let (shutdown_trigger, shutdown_signal) = triggered::trigger();
    ctrlc::set_handler(move || shutdown_trigger.trigger()).context("setting Ctrl-C handler")?;

    let store = Arc::new(FileStore::new(&args.datadir)?);
    let wallet = Arc::new(PayoutWallet::new(args.payout_script()?));
    let broadcaster = Arc::new(FileBroadcaster::new(args.outbox_path())?);
    let listener = Arc::new(PaymentChannelServerListener::new(
        wallet,
        broadcaster,
        Arc::new(StandardClock()),
        Some(store.clone() as Arc<dyn ChannelStore>),
        Arc::new(LoggingHandlerFactory),
        args.listener_config(),
    )?);
    if load_extension(store.as_ref(), listener.registry().as_ref())? {
        info!("restored {} open channels", listener.registry().len());
    }

    info!("paychand {} starting on {}", env!("CARGO_PKG_VERSION"), args.bind);
    listener.bind_and_serve(args.bind, shutdown_signal).await?;
    info!("paychand stopped");
    Ok(())
}
