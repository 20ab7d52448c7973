mod fixture_sandbox;

#[allow(unused_imports)]
pub use fixture_sandbox::*;

use rstest::*;

#[fixture]
pub fn launcher() -> Launcher {
    Launcher::new()
}
