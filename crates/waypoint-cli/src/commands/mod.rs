pub mod config;
pub mod run;

use comfy_table::{Table, presets::UTF8_FULL};
use waypoint_core::chunk::Value;

#[derive(Debug, Clone)]
pub struct OutputContext {
    pub json: bool,
    pub csv: bool,
    pub verbose: bool,
}

impl OutputContext {
    pub fn print_table(&self, columns: &[String], rows: &[Vec<Value>]) {
        if self.csv {
            let header: Vec<String> = columns.iter().map(|c| csv_field(c)).collect();
            println!("{}", header.join(","));
            for row in rows {
                let values: Vec<String> = row.iter().map(|v| csv_field(&value_to_string(v))).collect();
                println!("{}", values.join(","));
            }
            return;
        }

        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(columns);
        for row in rows {
            let values: Vec<String> = row.iter().map(value_to_string).collect();
            table.add_row(values);
        }
        println!("{table}");
    }

    pub fn print_json<T: serde::Serialize>(&self, data: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(data)?);
        Ok(())
    }

    pub fn print_success(&self, message: &str) {
        use colored::Colorize;
        println!("{} {}", "✓".green(), message);
    }

    pub fn print_error(&self, message: &str) {
        use colored::Colorize;
        eprintln!("{} {}", "✗".red(), message);
    }

    pub fn print_info(&self, message: &str) {
        use colored::Colorize;
        println!("{} {}", "ℹ".blue(), message);
    }
}

pub fn value_to_string(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Int64(i) => i.to_string(),
        Value::Float64(f) => format!("{f:.4}"),
        Value::Bool(b) => b.to_string(),
        Value::Utf8(s) => s.clone(),
    }
}

/// Quote a CSV field that holds a separator, a quote or a line break
pub fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(&Value::Null), "null");
        assert_eq!(value_to_string(&Value::Float64(0.5)), "0.5000");
        assert_eq!(value_to_string(&Value::Utf8("gold".into())), "gold");
    }

    #[test]
    fn test_csv_field_quotes_separators() {
        assert_eq!(csv_field("gold"), "gold");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }
}
