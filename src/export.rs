use super::*;

/// Errors that can occur when exporting or streaming snapshots.
#[derive(Debug)]
pub enum ExportError {
  Io(io::Error),
  Json(serde_json::Error),
}

impl Display for ExportError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error during export: {err}"),
      Self::Json(err) => write!(f, "failed to encode snapshot as json: {err}"),
    }
  }
}

impl std::error::Error for ExportError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
    }
  }
}

impl From<io::Error> for ExportError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for ExportError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

/// Streaming interface for snapshot consumers.
pub trait SnapshotStreamWriter {
  /// # Errors
  ///
  /// Returns an `ExportError` if the snapshot cannot be serialized or if
  /// the underlying writer fails to persist the data.
  fn write_snapshot(
    &mut self,
    snapshot: &SnapshotNode,
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError>;
}

/// JSON lines exporter that writes one JSON object per snapshot.
pub struct JsonLinesWriter<W: Write> {
  writer: W,
}

impl<W: Write> SnapshotStreamWriter for JsonLinesWriter<W> {
  fn write_snapshot(
    &mut self,
    snapshot: &SnapshotNode,
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError> {
    let chunk = StreamChunk::new(snapshot, timestamp);
    serde_json::to_writer(&mut self.writer, &chunk)?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }
}

impl<W: Write> JsonLinesWriter<W> {
  pub fn into_inner(self) -> W {
    self.writer
  }

  pub fn new(writer: W) -> Self {
    Self { writer }
  }
}

impl SnapshotNode {
  /// Serialize this tree to JSON using the provided writer.
  ///
  /// The tree is a private copy by the time callers hold it, so no
  /// synchronization is needed here.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), ExportError> {
    serde_json::to_writer(writer, self)?;
    Ok(())
  }

  /// Stream this tree into the provided writer.
  ///
  /// # Errors
  ///
  /// Returns an error if the downstream writer reports a failure.
  pub fn stream_into<W: SnapshotStreamWriter>(
    &self,
    writer: &mut W,
    timestamp: Option<SystemTime>,
  ) -> Result<(), ExportError> {
    writer.write_snapshot(self, timestamp)
  }
}

#[derive(Serialize)]
struct StreamChunk<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  timestamp_ns: Option<u128>,
  tree: &'a SnapshotNode,
}

impl<'a> StreamChunk<'a> {
  fn new(tree: &'a SnapshotNode, timestamp: Option<SystemTime>) -> Self {
    Self {
      timestamp_ns: timestamp.and_then(system_time_to_nanos),
      tree,
    }
  }
}

fn system_time_to_nanos(ts: SystemTime) -> Option<u128> {
  ts.duration_since(SystemTime::UNIX_EPOCH)
    .ok()
    .map(|duration| duration.as_nanos())
}
