//! Persistent bind state
//!
//! Binds survive a daemon restart through a single text file, one record
//! per line: `bus_id vendor_id product_id` (ids in hex). Writes go through
//! tempfile-and-rename so a crash never leaves a torn file, and through a
//! dedicated writer task so concurrent bind/unbind calls serialize and
//! fsync latency stays off the request path.

use common::{Error, Result};
use protocol::BusId;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// One persisted bind: the operator marked this device exportable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRecord {
    pub bus_id: BusId,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl BindRecord {
    /// Parse one line of the bind file
    fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let bus_id = fields
            .next()
            .ok_or_else(|| Error::Persistence("missing bus id".to_string()))?;
        let vendor = fields
            .next()
            .ok_or_else(|| Error::Persistence("missing vendor id".to_string()))?;
        let product = fields
            .next()
            .ok_or_else(|| Error::Persistence("missing product id".to_string()))?;
        if fields.next().is_some() {
            return Err(Error::Persistence(format!(
                "trailing fields in bind record: {line:?}"
            )));
        }

        let bus_id = BusId::new(bus_id)
            .map_err(|e| Error::Persistence(format!("bad bus id {bus_id:?}: {e}")))?;
        let vendor_id = u16::from_str_radix(vendor, 16)
            .map_err(|_| Error::Persistence(format!("bad vendor id {vendor:?}")))?;
        let product_id = u16::from_str_radix(product, 16)
            .map_err(|_| Error::Persistence(format!("bad product id {product:?}")))?;

        Ok(Self {
            bus_id,
            vendor_id,
            product_id,
        })
    }

    fn format_line(&self) -> String {
        format!(
            "{} {:04x} {:04x}",
            self.bus_id, self.vendor_id, self.product_id
        )
    }
}

/// Load the bind file; a missing file is an empty set
pub fn load_bind_file(path: &Path) -> Result<Vec<BindRecord>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No bind file at {}, starting empty", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        records.push(BindRecord::parse_line(line)?);
    }

    info!(
        "Loaded {} bind record(s) from {}",
        records.len(),
        path.display()
    );
    Ok(records)
}

/// Write the full bind set atomically: tempfile in the same directory,
/// fsync, rename over the target
fn store_bind_file(path: &Path, records: &[BindRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        for record in records {
            writeln!(file, "{}", record.format_line())?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    debug!("Wrote {} bind record(s) to {}", records.len(), path.display());
    Ok(())
}

enum PersistCmd {
    Write {
        records: Vec<BindRecord>,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// Handle to the persistence writer task
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<PersistCmd>,
}

impl PersistHandle {
    /// Replace the persisted bind set. Resolves once the rename has
    /// happened (or failed); callers decide how to degrade.
    pub async fn write(&self, records: Vec<BindRecord>) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(PersistCmd::Write { records, ack })
            .await
            .map_err(|_| Error::Channel("persistence task is gone".to_string()))?;
        ack_rx
            .await
            .map_err(|_| Error::Channel("persistence task dropped the ack".to_string()))?
    }
}

/// Spawn the single-writer persistence task for `path`
pub fn spawn_persist_task(path: PathBuf) -> PersistHandle {
    let (tx, mut rx) = mpsc::channel::<PersistCmd>(32);

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                PersistCmd::Write { records, ack } => {
                    let result = store_bind_file(&path, &records);
                    if let Err(ref e) = result {
                        error!("Failed to persist bind file: {}", e);
                    }
                    let _ = ack.send(result);
                }
            }
        }
        debug!("Persistence task for {} stopped", path.display());
    });

    PersistHandle { tx }
}
