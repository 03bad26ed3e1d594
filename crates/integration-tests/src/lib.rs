//! Registration plumbing for the vmlab end-to-end tests.
//!
//! Tests register themselves into a link-time slice with
//! [`integration_test!`]; the binary collects the slice and hands it to
//! libtest-mimic. This keeps each test next to the scenario it drives
//! instead of in one central list.

use color_eyre::Result;
use linkme::distributed_slice;

/// One registered end-to-end test.
pub struct IntegrationTest {
    pub name: &'static str,
    pub f: fn() -> Result<()>,
}

/// Every registered test, collected at link time.
#[distributed_slice]
pub static INTEGRATION_TESTS: [IntegrationTest];

/// Register a test function.
///
/// The registration static lives inside an anonymous const so the macro
/// never collides with the function's own name.
#[macro_export]
macro_rules! integration_test {
    ($test_fn:ident) => {
        const _: () = {
            #[linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            static REGISTRATION: $crate::IntegrationTest = $crate::IntegrationTest {
                name: stringify!($test_fn),
                f: $test_fn,
            };
        };
    };
}
