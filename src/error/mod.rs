//! Ошибки simbus.
//!
//! Типы сетевого уровня, кодека, доставки и топиков живут в крейте
//! `simbus-error` и переэкспортируются отсюда вместе с ошибками настроек и
//! логирования.

pub use simbus_error::*;

pub use crate::{config::SettingsError, logging::LoggingError};
