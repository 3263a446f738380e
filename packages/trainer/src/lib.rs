pub mod autograd;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod imageio;
pub mod logging;
pub mod model;
pub mod optim;
pub mod pickle;
pub mod training;
