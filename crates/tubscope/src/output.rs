//! Plain-text rendering of results.

use std::io::{self, Write};

use tubscope_core::{DeviceOwner, ResultSet};

/// Widest a table cell is allowed to get before truncation.
const MAX_CELL_WIDTH: usize = 32;

/// Aligned columns with a header rule.
pub fn write_table(out: &mut impl Write, rows: &ResultSet) -> io::Result<()> {
    let cells: Vec<Vec<String>> = rows
        .rows
        .iter()
        .map(|row| row.iter().map(|v| clip(&v.to_string())).collect())
        .collect();

    let widths: Vec<usize> = rows
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            cells
                .iter()
                .map(|row| row[idx].chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let header: Vec<String> =
        rows.columns.iter().zip(&widths).map(|(name, &w)| format!("{name:<w$}")).collect();
    writeln!(out, "{}", header.join("  ").trim_end())?;
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    writeln!(out, "{}", rule.join("  "))?;

    for row in &cells {
        let line: Vec<String> =
            row.iter().zip(&widths).map(|(cell, &w)| format!("{cell:<w$}")).collect();
        writeln!(out, "{}", line.join("  ").trim_end())?;
    }
    writeln!(out, "({} rows)", rows.row_count())
}

/// Header row then one record per row, `\n` terminated.
pub fn write_csv(out: &mut impl Write, rows: &ResultSet) -> io::Result<()> {
    let mut writer =
        csv::WriterBuilder::new().terminator(csv::Terminator::Any(b'\n')).from_writer(out);
    writer.write_record(&rows.columns).map_err(io::Error::from)?;
    for row in &rows.rows {
        writer.write_record(row.iter().map(|v| v.to_string())).map_err(io::Error::from)?;
    }
    writer.flush()
}

pub fn write_owners(out: &mut impl Write, owners: &[DeviceOwner]) -> io::Result<()> {
    if owners.is_empty() {
        return writeln!(out, "No matching users");
    }
    for owner in owners {
        writeln!(
            out,
            "{:<12} {:<32} {}",
            owner.user_id,
            owner.full_name,
            owner.esp_ble_id.as_deref().unwrap_or("-")
        )?;
    }
    Ok(())
}

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_CELL_WIDTH {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(MAX_CELL_WIDTH - 1).collect();
    clipped.push('…');
    clipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tubscope_core::Value;

    fn sample() -> ResultSet {
        ResultSet::new(
            vec!["updated_at".into(), "note".into()],
            vec![vec![Value::Text("2024-01-10 08:00:00".into()), Value::Text("a,\"b\"".into())]],
        )
    }

    #[test]
    fn test_csv_quotes_fields() {
        let mut out = Vec::new();
        write_csv(&mut out, &sample()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "updated_at,note\n2024-01-10 08:00:00,\"a,\"\"b\"\"\"\n");
    }

    #[test]
    fn test_csv_keeps_embedded_newlines_and_empty_cells() {
        let rows = ResultSet::new(
            vec!["updated_at".into(), "note".into(), "ph".into()],
            vec![vec![
                Value::Text("2024-01-10 08:00:00".into()),
                Value::Text("line 1\nline 2".into()),
                Value::Null,
            ]],
        );
        let mut out = Vec::new();
        write_csv(&mut out, &rows).unwrap();

        let mut reader = csv::Reader::from_reader(out.as_slice());
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0][1], "line 1\nline 2");
        assert_eq!(&records[0][2], "");
    }

    #[test]
    fn test_table_has_header_and_count() {
        let mut out = Vec::new();
        write_table(&mut out, &sample()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("updated_at"));
        assert!(lines[1].starts_with("----------"));
        assert_eq!(lines.last(), Some(&"(1 rows)"));
    }
}
