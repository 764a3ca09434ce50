pub mod cli_models;
pub mod desired_state;
pub mod settings;

pub const CHASSIS_SETTINGS_FOLDER: &str = "/var/lib/ovn-chassis/";
