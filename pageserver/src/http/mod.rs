pub mod routes;
pub use routes::make_router;
