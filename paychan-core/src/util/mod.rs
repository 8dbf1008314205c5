/// Clock
pub mod clock;
/// Test utilities
#[cfg(any(test, feature = "test_utils"))]
#[allow(missing_docs)]
pub mod test_utils;
