pub mod controller;
mod status;
mod syncset;

pub use controller::run;
