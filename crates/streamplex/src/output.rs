use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// A command result that can be rendered in every output format.
pub trait Report: Serialize {
    /// Ordered `(field, value)` pairs for table and pretty output.
    fn rows(&self) -> Vec<(&'static str, String)>;

    /// Bytes written in raw mode.
    fn raw(&self) -> &[u8];
}

pub fn print_report<R: Report>(report: &R, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in report.rows() {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let line = report
                .rows()
                .into_iter()
                .map(|(field, value)| format!("{field}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{line}");
        }
        OutputFormat::Raw => print_raw(report.raw()),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// SHA-256 of `data`, hex encoded.
pub fn digest(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
