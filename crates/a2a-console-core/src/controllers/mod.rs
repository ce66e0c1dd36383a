pub mod console_controller;

pub use console_controller::{CANCELLED_NOTICE, ConsoleController, TurnStart};
