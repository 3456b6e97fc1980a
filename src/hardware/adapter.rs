//! Line-oriented command transports for instrument drivers.
//!
//! Drivers speak ASCII commands terminated by a newline and read one reply line per
//! query. [`ScriptedAdapter`] replays canned replies for tests and dry runs;
//! `VisaAdapter` talks to a real GPIB/USB resource through NI-VISA.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Transport used by command-driven instrument drivers.
#[async_trait]
pub trait Adapter: Send {
    /// Sends one command; the terminator is appended by the adapter.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Reads one reply line with the terminator stripped.
    async fn read_line(&mut self) -> Result<String>;
}

/// Adapter that records every command and answers reads from a queue.
#[derive(Debug, Default, Clone)]
pub struct ScriptedAdapter {
    written: Arc<Mutex<Vec<String>>>,
    replies: Arc<Mutex<VecDeque<Result<String, String>>>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply line.
    pub fn reply(&self, line: impl Into<String>) -> &Self {
        self.push(Ok(line.into()));
        self
    }

    /// Queues a transport failure.
    pub fn fail(&self, reason: impl Into<String>) -> &Self {
        self.push(Err(reason.into()));
        self
    }

    /// Every command written so far.
    pub fn written(&self) -> Vec<String> {
        match self.written.lock() {
            Ok(w) => w.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, reply: Result<String, String>) {
        match self.replies.lock() {
            Ok(mut r) => r.push_back(reply),
            Err(poisoned) => poisoned.into_inner().push_back(reply),
        }
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    async fn write(&mut self, command: &str) -> Result<()> {
        self.written
            .lock()
            .map_err(|_| anyhow!("scripted adapter lock poisoned"))?
            .push(command.to_string());
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let next = self
            .replies
            .lock()
            .map_err(|_| anyhow!("scripted adapter lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(line)) => Ok(line),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Err(anyhow!("read timed out: no scripted reply left")),
        }
    }
}

#[cfg(feature = "instrument_visa")]
pub use visa::VisaAdapter;

#[cfg(feature = "instrument_visa")]
mod visa {
    use super::Adapter;
    use anyhow::{anyhow, Context, Result};
    use async_trait::async_trait;
    use std::ffi::CString;
    use std::io::{BufRead, BufReader, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing::debug;
    use visa_rs::prelude::*;

    /// NI-VISA session, e.g. `GPIB0::4::INSTR`.
    ///
    /// VISA calls block, so every transfer runs on the blocking pool.
    pub struct VisaAdapter {
        resource: String,
        terminator: String,
        instrument: Arc<Mutex<Instrument>>,
    }

    impl VisaAdapter {
        pub async fn open(resource: &str, terminator: &str, timeout: Duration) -> Result<Self> {
            let name = resource.to_string();
            let instrument = tokio::task::spawn_blocking(move || -> Result<Instrument> {
                let rm = DefaultRM::new().map_err(|e| anyhow!("VISA resource manager: {:?}", e))?;
                let expr = CString::new(name.clone()).context("resource name contains NUL")?;
                rm.open(&expr.into(), AccessMode::NO_LOCK, timeout)
                    .map_err(|e| anyhow!("failed to open {}: {:?}", name, e))
            })
            .await
            .context("VISA open task panicked")??;

            debug!(resource, "VISA resource opened");
            Ok(Self {
                resource: resource.to_string(),
                terminator: terminator.to_string(),
                instrument: Arc::new(Mutex::new(instrument)),
            })
        }
    }

    #[async_trait]
    impl Adapter for VisaAdapter {
        async fn write(&mut self, command: &str) -> Result<()> {
            let instrument = self.instrument.clone();
            let line = format!("{}{}", command, self.terminator);
            let resource = self.resource.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut instr = instrument
                    .lock()
                    .map_err(|_| anyhow!("VISA session lock poisoned"))?;
                instr
                    .write_all(line.as_bytes())
                    .with_context(|| format!("VISA write to {} failed", resource))
            })
            .await
            .context("VISA write task panicked")?
        }

        async fn read_line(&mut self) -> Result<String> {
            let instrument = self.instrument.clone();
            let resource = self.resource.clone();
            tokio::task::spawn_blocking(move || -> Result<String> {
                let instr = instrument
                    .lock()
                    .map_err(|_| anyhow!("VISA session lock poisoned"))?;
                let mut line = String::new();
                BufReader::new(&*instr)
                    .read_line(&mut line)
                    .with_context(|| format!("VISA read from {} failed", resource))?;
                Ok(line.trim_end().to_string())
            })
            .await
            .context("VISA read task panicked")?
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_adapter_replays_in_order() {
        let script = ScriptedAdapter::new();
        script.reply("1").fail("bus error").reply("2");
        let mut adapter = script.clone();

        adapter.write("DO").await.unwrap();
        assert_eq!(adapter.read_line().await.unwrap(), "1");
        assert!(adapter.read_line().await.is_err());
        assert_eq!(adapter.read_line().await.unwrap(), "2");
        assert!(adapter.read_line().await.is_err());
        assert_eq!(script.written(), vec!["DO".to_string()]);
    }
}
