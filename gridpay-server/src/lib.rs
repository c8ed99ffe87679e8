pub mod api;
pub mod config;
pub mod engine;
pub mod store;

use engine::Engine;

// AppState must be defined in lib.rs to be visible to all modules.
#[derive(Clone)]
pub struct AppState<M, L, A, C> {
    pub engine: Engine<M, L, A, C>,
}
