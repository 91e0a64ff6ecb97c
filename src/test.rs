//! Test-only helpers shared across integration tests.

use rand::Rng;

/// A high, unprivileged port unlikely to collide across parallel test runs.
#[allow(dead_code)]
pub fn random_port() -> u16 {
    let mut rng = rand::rng();

    rng.random_range(10_000..30_000)
}
