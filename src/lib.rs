//! A version-controlled store for geospatial datasets.
//!
//! ## Overview
//!
//! A repository is a content-addressed object store (commits, trees, blobs,
//! via `git2`) holding one working copy per checkout. Two kinds of dataset
//! are supported: tabular vector layers, materialized as a [`Gpkg`] working
//! copy with a GeoPackage-native feature table plus a handful of side
//! tables and triggers that track pending edits (see [`workingcopy`]); and
//! point-cloud tile sets, materialized as a directory of LAZ/COPC tiles
//! tracked via LFS-style pointer files (see [`pointcloud`]).
//!
//! ## Checkout and commit
//!
//! ```no_run
//! use georepo::{repo, workingcopy};
//!
//! # fn run() -> georepo::Result<()> {
//! let repo = repo::discover(std::path::Path::new("."))?;
//! let head_tree = repo::head_tree(&repo)?;
//! let head_oid = head_tree.id();
//! workingcopy::checkout_new(std::path::Path::new("my.gpkg"), &repo, &head_tree, head_oid, "points")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Integrity
//!
//! `workingcopy::fsck` cross-checks a layer's recorded tree, side tables, and
//! user table against the repository tree; `workingcopy::reset_layer` repairs
//! a layer found to have drifted by tearing it down and re-checking it out.
//!
//! The `georepo` binary wraps this crate's engines in a `clap`-derived CLI;
//! see [`cli`].
pub mod cli;
pub mod config;
mod conversions;
pub mod error;
mod geometry;
mod gpkg;
mod meta;
mod ogc_sql;
pub mod pointcloud;
mod pointer;
pub mod repo;
mod sql_functions;
pub mod types;
pub mod workingcopy;

pub use cli::{run, Cli};
pub use config::{read_working_copy_config, write_working_copy_config, WorkingCopyConfig, WorkingCopyScheme};
pub use error::{RepoError, Result};
pub use geometry::{geom_envelope, geom_to_ewkb, gpkg_geometry_to_wkb, hexewkb_to_geom, parse_gpkg_geom, wkb_to_gpkg_geometry};
pub use gpkg::Gpkg;
pub use pointcloud::{apply_tile_change, working_copy_diff as point_cloud_working_copy_diff, ConvertFn, TileChange};
pub use pointer::Pointer;
pub use sql_functions::register_spatial_functions;
pub use types::{ColumnSpec, ColumnType, Value};
pub use workingcopy::{checkout_new, checkout_update, commit, fsck, reset_layer, FeatureChange, FsckReport, MetaChange};
