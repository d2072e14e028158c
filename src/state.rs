use crate::{config::Config, storage::Store};

/// Shared state behind every request. Core operations live in `impl` blocks
/// spread over the lecture, user, question and poll modules.
pub struct AppState<S> {
    pub store: S,
    pub config: Config,
}

impl<S: Store> AppState<S> {
    pub fn new(store: S, config: Config) -> Self {
        Self { store, config }
    }
}
