pub mod conn;
pub mod pending;
pub mod pool;
pub mod transport;

pub use conn::{Connection, ConnectionOptions};
pub use pending::{PendingQueue, PendingRequest};
pub use pool::NodePool;
pub use transport::{Transport, TransportOptions};
