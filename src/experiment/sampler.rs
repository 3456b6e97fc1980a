//! Background temperature sampler.
//!
//! Reads the stage once per interval, appends the reading to the temperature log and
//! publishes it on a watch channel. It never touches the experiment snapshot.

use crate::stage::TemperatureStage;
use crate::telemetry::{TelemetryRecorder, TemperatureSample};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub struct TemperatureSampler {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TemperatureSampler {
    /// Starts sampling; elapsed seconds are counted from `started`.
    pub fn spawn(
        stage: Arc<dyn TemperatureStage>,
        recorder: TelemetryRecorder,
        period: Duration,
        started: Instant,
        publish: watch::Sender<Option<TemperatureSample>>,
    ) -> Self {
        let (shutdown, mut stop) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {}
                }

                let temperature = match stage.read_temperature().await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "Temperature read failed, sample skipped");
                        continue;
                    }
                };
                let sample = TemperatureSample {
                    elapsed_seconds: started.elapsed().as_secs(),
                    temperature,
                };
                if let Err(e) = recorder.append_temperature(&sample) {
                    warn!(error = %e, "Could not append temperature sample");
                }
                publish.send_replace(Some(sample));
            }
            debug!("Temperature sampler stopped");
        });

        Self {
            shutdown: Some(shutdown),
            handle,
        }
    }

    /// Stops sampling and waits for the task to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Temperature sampler task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedStage;
    use tempfile::TempDir;

    #[tokio::test(start_paused = true)]
    async fn test_samples_round_trip_in_order() {
        let root = TempDir::new().unwrap();
        let recorder = TelemetryRecorder::create(root.path(), "sampler").unwrap();
        recorder.start_temperature_log().unwrap();

        let stage = Arc::new(SimulatedStage::new());
        stage.begin_heating(40.0, 30.0, 0).await.unwrap();
        let (tx, mut rx) = watch::channel(None);
        let sampler = TemperatureSampler::spawn(
            stage,
            recorder.clone(),
            Duration::from_secs(1),
            Instant::now(),
            tx,
        );

        rx.wait_for(|s| s.is_some_and(|s| s.elapsed_seconds >= 10))
            .await
            .unwrap();
        sampler.stop().await;

        let samples = recorder.read_temperature_log().unwrap();
        assert!(samples.len() >= 11);
        assert!(samples
            .windows(2)
            .all(|w| w[0].elapsed_seconds <= w[1].elapsed_seconds));
        assert!(samples
            .windows(2)
            .all(|w| w[0].temperature <= w[1].temperature));
        assert_eq!(samples[0].temperature, 22.0);
    }
}
