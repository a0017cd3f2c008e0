#![forbid(unsafe_code)]

#[macro_use]
extern crate educe;

pub mod config;
pub mod delay_queue;
pub mod error;
pub mod handler_set;
pub mod hash_table;
pub mod poller;
mod scheduler;
pub mod time;
pub mod trigger;

pub use config::SchedulerConfig;
pub use delay_queue::TaskToken;
pub use error::{Result, SchedulerError};
pub use handler_set::{Condition, Socket};
pub use hash_table::HashTable;
pub use scheduler::{BackgroundHandler, TaskScheduler, TriggerHandler};
pub use time::{DelayInterval, EventTime};
pub use trigger::{ClientData, EventTriggerId, TriggerHandle};
