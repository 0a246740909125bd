// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Typed column descriptors for bronze tables.
//!
//! The vendor files carry no schema; the column set and types are sniffed
//! from the leading rows of the first file per exchange and pinned in the
//! store. Later files unify by name, widening the table with nullable
//! columns for anything new.

use csv_async::StringRecord;
use duckdb::types::Value;

/// Storage type of one sniffed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Double,
    Varchar,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE",
            ColumnType::Varchar => "VARCHAR",
        }
    }

    /// Map a DuckDB `information_schema` data type back onto a descriptor.
    pub fn from_sql(data_type: &str) -> Self {
        match data_type.to_ascii_uppercase().as_str() {
            "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "HUGEINT" => ColumnType::BigInt,
            "FLOAT" | "REAL" | "DOUBLE" => ColumnType::Double,
            other if other.starts_with("DECIMAL") => ColumnType::Double,
            _ => ColumnType::Varchar,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
}

/// The sniffed schema of one source file, in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    /// Infer column types from a sample of rows. A column that parses as
    /// integer everywhere it is non-empty is BIGINT, one that parses as a
    /// number is DOUBLE, anything else is VARCHAR. Columns that are empty
    /// throughout the sample stay VARCHAR.
    pub fn infer(headers: &StringRecord, sample: &[StringRecord]) -> Self {
        let columns = headers
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let mut seen_value = false;
                let mut integral = true;
                let mut numeric = true;
                for row in sample {
                    let cell = row.get(index).unwrap_or("");
                    if cell.is_empty() {
                        continue;
                    }
                    seen_value = true;
                    if integral && cell.parse::<i64>().is_err() {
                        integral = false;
                    }
                    if numeric && cell.parse::<f64>().is_err() {
                        numeric = false;
                        break;
                    }
                }
                let column_type = if !seen_value {
                    ColumnType::Varchar
                } else if integral {
                    ColumnType::BigInt
                } else if numeric {
                    ColumnType::Double
                } else {
                    ColumnType::Varchar
                };
                ColumnDescriptor {
                    name: name.to_string(),
                    column_type,
                }
            })
            .collect();
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Convert one CSV cell to a bind value under the pinned column type.
/// Empty cells become NULL; anything unparseable is reported to the caller
/// with enough context for the ledger's `error_message`.
pub fn convert_cell(
    cell: &str,
    descriptor: &ColumnDescriptor,
) -> Result<Value, String> {
    if cell.is_empty() {
        return Ok(Value::Null);
    }
    match descriptor.column_type {
        ColumnType::BigInt => cell
            .parse::<i64>()
            .map(Value::BigInt)
            .map_err(|_| format!("column {:?}: {cell:?} is not a BIGINT", descriptor.name)),
        ColumnType::Double => cell
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|_| format!("column {:?}: {cell:?} is not a DOUBLE", descriptor.name)),
        ColumnType::Varchar => Ok(Value::Text(cell.to_string())),
    }
}

/// Double-quote an identifier for DuckDB DDL/DML. Vendor headers contain
/// characters like `#` and `-`.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[&str]) -> StringRecord {
        StringRecord::from(fields.to_vec())
    }

    #[test]
    fn infer_picks_the_narrowest_type_that_fits() {
        let headers = record(&["#RIC", "Price", "Volume", "Qualifiers", "Empty"]);
        let sample = vec![
            record(&["VOD.L", "68.42", "1200", "AUT[GV4]", ""]),
            record(&["VOD.L", "68.44", "300", "", ""]),
            record(&["BARC.L", "2.61", "5000", "OB[IRGCOND]", ""]),
        ];
        let schema = TableSchema::infer(&headers, &sample);
        let types: Vec<_> = schema.columns.iter().map(|c| c.column_type).collect();
        assert_eq!(
            types,
            vec![
                ColumnType::Varchar,
                ColumnType::Double,
                ColumnType::BigInt,
                ColumnType::Varchar,
                ColumnType::Varchar,
            ]
        );
    }

    #[test]
    fn infer_with_no_sample_rows_defaults_to_varchar() {
        let headers = record(&["Price", "Volume"]);
        let schema = TableSchema::infer(&headers, &[]);
        assert!(schema
            .columns
            .iter()
            .all(|c| c.column_type == ColumnType::Varchar));
    }

    #[test]
    fn convert_cell_enforces_pinned_types() {
        let bigint = ColumnDescriptor {
            name: "Volume".to_string(),
            column_type: ColumnType::BigInt,
        };
        assert_eq!(convert_cell("1200", &bigint).unwrap(), Value::BigInt(1200));
        assert_eq!(convert_cell("", &bigint).unwrap(), Value::Null);
        let err = convert_cell("12x0", &bigint).unwrap_err();
        assert!(err.contains("Volume"));
        assert!(err.contains("12x0"));

        let double = ColumnDescriptor {
            name: "Price".to_string(),
            column_type: ColumnType::Double,
        };
        assert_eq!(convert_cell("68.42", &double).unwrap(), Value::Double(68.42));
        assert!(convert_cell("n/a", &double).is_err());
    }

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("#RIC"), "\"#RIC\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
