use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize the record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("the column headers must come before the first row")]
    LateHeaders,
}

impl Args {
    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<dyn std::io::Write>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ),
        };
        Ok(Output::new(self.format, io, self.output))
    }
}

pub struct Output {
    destination: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { writer: csv_core::Writer, buffer: Vec<u8>, written_rows: bool },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

impl Output {
    fn new(format: Format, io: Box<dyn std::io::Write>, destination: Option<PathBuf>) -> Self {
        let formatter = match format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv {
                writer: csv_core::Writer::new(),
                buffer: vec![0; 256],
                written_rows: false,
            },
        };
        Output { destination, io, formatter }
    }

    pub fn table_headers(&mut self, headers: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_rows: true, .. } => return Err(Error::LateHeaders),
            Formatter::Csv { .. } => self.write_csv_row(&headers)?,
            Formatter::Table { comfy } => {
                comfy.set_header(headers);
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    /// Encode one CSV row, growing the scratch buffer whenever a field does not fit.
    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let Formatter::Csv { writer, buffer, written_rows } = &mut self.formatter else {
            return Ok(());
        };
        let mut row = Vec::new();
        for (index, value) in values.iter().enumerate() {
            if index > 0 {
                encode(buffer, &mut row, |out| {
                    let (result, written) = writer.delimiter(out);
                    (result, 0, written)
                });
            }
            let mut input = value.as_ref().as_bytes();
            loop {
                let (result, read, written) = writer.field(input, buffer.as_mut_slice());
                row.extend_from_slice(&buffer[..written]);
                input = &input[read..];
                match result {
                    WriteResult::InputEmpty => break,
                    WriteResult::OutputFull => buffer.resize(buffer.len() * 2, 0),
                }
            }
        }
        encode(buffer, &mut row, |out| {
            let (result, written) = writer.terminator(out);
            (result, 0, written)
        });
        *written_rows = true;
        self.io.write_all(&row).map_err(|e| self.write_error(e))
    }

    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { .. } => {
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    /// Push out what was written so far. Tables are only laid out once committed.
    pub fn flush(&mut self) -> Result<(), Error> {
        if let Formatter::Table { .. } = self.formatter {
            return Ok(());
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.destination {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy } = &self.formatter {
            self.io.write_fmt(format_args!("{comfy}\n")).map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

/// Run a `csv_core` step that consumes no input, retrying with a larger buffer when it is full.
fn encode(
    buffer: &mut Vec<u8>,
    row: &mut Vec<u8>,
    mut step: impl FnMut(&mut [u8]) -> (WriteResult, usize, usize),
) {
    loop {
        let (result, _, written) = step(buffer.as_mut_slice());
        row.extend_from_slice(&buffer[..written]);
        match result {
            WriteResult::InputEmpty => return,
            WriteResult::OutputFull => buffer.resize(buffer.len() * 2, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(format: Format, rows: &[[&str; 2]]) -> Result<String, Error> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let args = Args { output: Some(path.clone()), format };
        let mut output = args.to_output()?;
        output.table_headers(vec!["Key", "Value"])?;
        for row in rows {
            output.result(
                || row.iter().map(|v| v.to_string()).collect(),
                || serde_json::json!({ "key": row[0], "value": row[1] }),
            )?;
        }
        output.commit()?;
        Ok(std::fs::read_to_string(path).unwrap())
    }

    #[test]
    fn csv_quotes_fields() {
        let long = "x".repeat(1000);
        let out = write(Format::Csv, &[["ph_data", "7.2"], ["name", "Pool, \"main\""], ["long", &long]])
            .unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("Key,Value"));
        assert_eq!(lines.next(), Some("ph_data,7.2"));
        assert_eq!(lines.next(), Some("name,\"Pool, \"\"main\"\"\""));
        assert_eq!(lines.next(), Some(format!("long,{long}").as_str()));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn jsonl_has_one_record_per_line() {
        let out = write(Format::Jsonl, &[["ph_data", "7.2"], ["redox_data", "650"]]).unwrap();
        assert_eq!(
            out,
            "{\"key\":\"ph_data\",\"value\":\"7.2\"}\n{\"key\":\"redox_data\",\"value\":\"650\"}\n"
        );
    }

    #[test]
    fn table_is_written_on_commit() {
        let out = write(Format::Table, &[["ph_data", "7.2"]]).unwrap();
        assert!(out.contains("Key"));
        assert!(out.contains("ph_data"));
    }

    #[test]
    fn csv_headers_come_first() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args { output: Some(dir.path().join("out")), format: Format::Csv };
        let mut output = args.to_output().unwrap();
        output.result(|| vec!["a".into()], || "a").unwrap();
        assert!(matches!(output.table_headers(vec!["Key"]), Err(Error::LateHeaders)));
    }
}
