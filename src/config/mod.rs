pub mod settings;

pub use settings::SupervisorSettings;
