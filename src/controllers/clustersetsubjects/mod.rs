pub mod controller;
mod mutator;

pub use controller::run;
