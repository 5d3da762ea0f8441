pub mod config_store;
pub mod i2c_secondary;
pub mod led_button;
pub mod state_machine;
