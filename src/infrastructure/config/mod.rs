mod settings;

pub use settings::{
    BrokerConfig, ConsumerDefaults, OtelConfig, PersistentQueueOptions, ServerConfig, Settings,
};
