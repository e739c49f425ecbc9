mod model;

pub use model::{FluxConfig, FluxModel};
