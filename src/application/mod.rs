pub mod backend;
pub mod binder;
pub mod invoker;
pub mod mediator;
pub mod registry;
pub mod session;
