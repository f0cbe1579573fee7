//! thyme: scheduled website-health surveillance for a single marketing site.
//!
//! Three times a week the scan pipeline refreshes per-page signals from the
//! external data sources (analytics, search index, speed tester, CMS, link
//! checker), computes a composite health score per page, and escalates the
//! worst pages to an LLM investigation loop that files findings for human
//! review. A Sunday job runs the deeper site-wide audit and writes a
//! narrative digest.

pub mod agent;
pub mod audit;
pub mod config;
pub mod db;
pub mod inventory;
pub mod scan;
pub mod scheduler;
pub mod scoring;
pub mod server;
pub mod signals;
pub mod sources;
pub mod token;
pub mod util;
pub mod weekly;
pub mod writer;
