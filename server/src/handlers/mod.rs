pub mod health_handlers;
pub mod ingress_handlers;
