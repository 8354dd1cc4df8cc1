use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use cishift::diagnostics::Severity;
use cishift::ir::Confidence;

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| Cell::new(*label).fg(TableColor::Cyan))
        .collect()
}

pub fn severity_cell(severity: Severity) -> Cell {
    match severity {
        Severity::Error => Cell::new(severity).fg(TableColor::Red),
        Severity::Warning => Cell::new(severity).fg(TableColor::Yellow),
    }
}

pub fn confidence_cell(confidence: Confidence) -> Cell {
    match confidence {
        Confidence::Native => Cell::new(confidence).fg(TableColor::Green),
        Confidence::Approximate => Cell::new(confidence).fg(TableColor::Yellow),
        Confidence::Manual => Cell::new(confidence).fg(TableColor::Red),
    }
}

pub fn count_cell(value: usize, error: bool) -> Cell {
    let cell = Cell::new(value);
    match (value, error) {
        (0, _) => cell.fg(TableColor::Green),
        (_, false) => cell.fg(TableColor::Yellow),
        (_, true) => cell.fg(TableColor::Red),
    }
}
