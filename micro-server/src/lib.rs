//! Request dispatch: the middleware chain, the handler table, and the RPC
//! server loop that ties a [`Transport`](micro_transport::Transport) to a
//! [`Dispatcher`].

pub mod dispatcher;
pub mod handler;
pub mod middleware;
pub mod server;

pub use dispatcher::{apply_error, Dispatcher};
pub use handler::{method_fn, raw_fn, Handler};
pub use middleware::{Middleware, Next};
pub use server::{Server, ServerConfig, ServerError};
