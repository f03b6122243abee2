use rand::seq::SliceRandom;
use reqwest::RequestBuilder;

use crate::domain::ManagerEndpoint;

pub const INTERNAL_SECRET_HEADER: &str = "x-internal-secret";

/// Attaches the shared cluster secret expected by managers.
pub fn with_internal_secret(builder: RequestBuilder, secret: &str) -> RequestBuilder {
    builder.header(INTERNAL_SECRET_HEADER, secret)
}

/// Managers are interchangeable; spread calls uniformly across them.
pub fn pick_manager(managers: &[ManagerEndpoint]) -> Option<&ManagerEndpoint> {
    managers.choose(&mut rand::thread_rng())
}
