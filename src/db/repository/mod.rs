pub mod calendar_connection;
pub mod kv_store;
pub mod reminder_store;

pub use calendar_connection::CalendarConnectionRepository;
pub use kv_store::{KeyValueStorage, SqliteKeyValueStorage};
pub use reminder_store::ReminderStore;
