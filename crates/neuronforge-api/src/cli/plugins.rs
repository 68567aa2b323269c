//! `nforge plugins`: list what `plugin_action` steps can call.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use neuronforge_core::workflow::capability::PluginExecutor;

use crate::state::AppState;

pub fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let plugins = state.registry.plugins();

    if json {
        println!("{}", serde_json::to_string_pretty(&plugins)?);
        return Ok(());
    }

    if plugins.is_empty() {
        println!();
        println!("  No plugins registered.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Plugin").fg(Color::Cyan),
            Cell::new("Actions"),
            Cell::new("Description"),
        ]);

    for plugin in &plugins {
        table.add_row(vec![
            Cell::new(&plugin.key),
            Cell::new(plugin.actions.join(", ")),
            Cell::new(&plugin.description),
        ]);
    }

    println!();
    println!("  {} plugin(s) registered", style(plugins.len()).cyan());
    println!();
    println!("{table}");
    println!();

    Ok(())
}
