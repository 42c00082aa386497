use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use arrow_array::builder::{Float64Builder, Int64Builder, StringBuilder};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use parquet::arrow::arrow_writer::ArrowWriter;

use crate::group::GroupView;

/// Schema of exported histograms, one row per bucket
pub fn create_report_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("group", DataType::Utf8, false),
        Field::new("bucket_start", DataType::Int64, false),
        Field::new("bucket_width", DataType::Int64, false),
        Field::new("total_seconds", DataType::Int64, false),
        Field::new("value", DataType::Float64, false),
        Field::new("unit", DataType::Utf8, false),
    ]))
}

/// Converts a group's view to a record batch
pub fn view_to_batch(group: &str, view: &GroupView, schema: SchemaRef) -> Result<RecordBatch> {
    let rows = view.buckets.len();

    let mut group_builder = StringBuilder::with_capacity(rows, rows * group.len());
    let mut start_builder = Int64Builder::with_capacity(rows);
    let mut width_builder = Int64Builder::with_capacity(rows);
    let mut total_builder = Int64Builder::with_capacity(rows);
    let mut value_builder = Float64Builder::with_capacity(rows);
    let mut unit_builder = StringBuilder::with_capacity(rows, rows * 8);

    for bucket in &view.buckets {
        group_builder.append_value(group);
        start_builder.append_value(bucket.start as i64);
        width_builder.append_value(view.bucket_width as i64);
        total_builder.append_value(bucket.total as i64);
        value_builder.append_value(bucket.value);
        unit_builder.append_value(view.unit.label());
    }

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(group_builder.finish()),
        Arc::new(start_builder.finish()),
        Arc::new(width_builder.finish()),
        Arc::new(total_builder.finish()),
        Arc::new(value_builder.finish()),
        Arc::new(unit_builder.finish()),
    ];

    RecordBatch::try_new(schema, arrays).map_err(|e| anyhow!("Failed to create RecordBatch: {}", e))
}

/// Writes group histograms to a Parquet file
pub struct ReportWriter<W: Write + Send> {
    writer: ArrowWriter<W>,
    schema: SchemaRef,
}

impl<W: Write + Send> ReportWriter<W> {
    pub fn new(writer: W) -> Result<Self> {
        let schema = create_report_schema();
        let arrow_writer = ArrowWriter::try_new(writer, schema.clone(), None)
            .map_err(|e| anyhow!("Failed to create Arrow writer: {}", e))?;

        Ok(Self {
            writer: arrow_writer,
            schema,
        })
    }

    /// Appends the buckets of one group
    pub fn write(&mut self, group: &str, view: &GroupView) -> Result<()> {
        let batch = view_to_batch(group, view, self.schema.clone())?;
        self.writer
            .write(&batch)
            .map_err(|e| anyhow!("Failed to write batch to Parquet: {}", e))
    }

    /// Writes the footer and hands back the underlying writer
    pub fn finish(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to close Parquet writer: {}", e))
    }
}
