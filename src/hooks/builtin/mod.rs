mod delivery_logger;

pub use delivery_logger::DeliveryLoggerHook;
