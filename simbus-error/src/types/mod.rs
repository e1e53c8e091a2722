pub mod codec;
pub mod executor;
pub mod network;
pub mod topic;

// Публичный экспорт всех типов ошибок из вложенных модулей, чтобы упростить
// доступ к ним из внешнего кода.
pub use codec::*;
pub use executor::*;
pub use network::*;
pub use topic::*;
