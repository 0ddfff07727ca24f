//! StockETL Core: records, upstream providers, staging files and the pure
//! data steps of the pipeline.
//!
//! - Domain records (raw, clean, merged) and date windows
//! - Alpha Vantage and Yahoo Finance providers behind the `DataProvider` trait
//! - CSV staging codec shared by every step
//! - Raw and merged-file validators
//! - Transformer (daily change, rolling volatility) and cross-source merger
//! - Warehouse table schema
//!
//! Nothing here knows about run directories, buckets or tables; that lives in
//! `stocketl-runner`.

pub mod data;
pub mod domain;
pub mod merge;
pub mod schema;
pub mod staging;
pub mod transform;
pub mod validate;
