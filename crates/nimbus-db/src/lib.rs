//! Durable storage for the Nimbus core engine.
//!
//! Thin, typed query layer over PostgreSQL: row structs and closed enums in
//! [`models`], connection/migration management in [`pool`] and [`config`],
//! and one query module per entity under [`queries`].

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
