//! Command implementations behind the clap surface in `main.rs`.

pub mod ingest;

pub use ingest::{run_quest_ingest, run_whoop_auth, run_whoop_ingest, QuestArgs, WhoopArgs};
