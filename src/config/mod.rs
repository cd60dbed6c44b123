// Configuration module
// Public interface for configuration loading

mod device;
mod loader;
mod settings;

pub use device::DevicePreference;
pub use loader::{default_config_path, load_config};
pub use settings::{
    AccumulationBoundary, DataSection, LanguageSection, LoraSection, LossReduction, ModelSection,
    OptimSection, RecordPolicy, RunSection, TrainConfig,
};
