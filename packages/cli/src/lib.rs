// ABOUTME: Library half of the sandkeep CLI: wiring the store, runtime and reconciler
// ABOUTME: Also holds the table and summary renderers shared by the subcommands

pub mod context;
pub mod render;
