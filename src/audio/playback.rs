//! Playback output
//!
//! Owns the stereo sample ring and, when a device is available, an output
//! stream running on its own thread. Without a device the output runs
//! headless: samples still land in the ring so mixing behaves the same.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;

use crate::audio::buffer::{SampleRing, SharedSampleRing};
use crate::constants::{OPUS_SAMPLE_RATE, PLAYBACK_CHANNELS};
use crate::error::AudioError;

/// Stereo 48 kHz playback sink
pub struct PlaybackOutput {
    ring: SharedSampleRing,

    /// Whether the device thread should keep its stream alive
    running: Arc<AtomicBool>,

    /// Device thread handle, absent when headless
    thread_handle: Option<JoinHandle<()>>,

    /// Stream errors reported by the device callback
    error_rx: Option<Receiver<AudioError>>,

    device_name: Option<String>,
}

impl PlaybackOutput {
    /// Ring-only output with no device attached
    pub fn headless(buffer_ms: u32) -> Self {
        Self {
            ring: Arc::new(SampleRing::for_duration(
                buffer_ms,
                OPUS_SAMPLE_RATE,
                PLAYBACK_CHANNELS,
            )),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            device_name: None,
        }
    }

    /// Headless output with a hand-fed error channel standing in for a device
    #[cfg(test)]
    pub(crate) fn with_error_feed(buffer_ms: u32) -> (Self, crossbeam_channel::Sender<AudioError>) {
        let (error_tx, error_rx) = crossbeam_channel::bounded(16);
        let mut output = Self::headless(buffer_ms);
        output.error_rx = Some(error_rx);
        (output, error_tx)
    }

    /// Open playback on the named device (or the default one).
    ///
    /// Falls back to headless output when `use_device` is false or the
    /// device cannot be opened.
    pub fn open(device_name: Option<&str>, buffer_ms: u32, use_device: bool) -> Self {
        let mut output = Self::headless(buffer_ms);
        output.device_name = device_name.map(str::to_string);

        if !use_device {
            return output;
        }

        match output.start_device() {
            Ok(()) => {
                tracing::info!(
                    "Playback started on {}",
                    output.device_name.as_deref().unwrap_or("default device")
                );
            }
            Err(e) => {
                tracing::warn!("Playback device unavailable, running headless: {}", e);
            }
        }
        output
    }

    #[cfg(feature = "device-playback")]
    fn start_device(&mut self) -> Result<(), AudioError> {
        use cpal::traits::{DeviceTrait, StreamTrait};
        use crossbeam_channel::bounded;
        use std::thread;
        use std::time::Duration;

        let device = crate::audio::device::output_device(self.device_name.as_deref())?;
        let config = cpal::StreamConfig {
            channels: PLAYBACK_CHANNELS,
            sample_rate: cpal::SampleRate(OPUS_SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let ring = self.ring.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || {
                let mut scratch: Vec<i16> = Vec::new();
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0);
                        ring.pop_into(&mut scratch);
                        for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                            *out = sample as f32 / 32768.0;
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let started = ready_rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap_or_else(|_| Err(AudioError::StreamError("device did not start".to_string())));

        match started {
            Ok(()) => {
                self.thread_handle = Some(handle);
                self.error_rx = Some(error_rx);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
        }
    }

    #[cfg(not(feature = "device-playback"))]
    fn start_device(&mut self) -> Result<(), AudioError> {
        Err(AudioError::DeviceNotFound(
            "built without device playback".to_string(),
        ))
    }

    /// Queue interleaved stereo samples. Returns how many old samples were discarded.
    pub fn write(&self, stereo: &[i16]) -> usize {
        self.ring.push_slice(stereo)
    }

    pub fn ring(&self) -> &SharedSampleRing {
        &self.ring
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Whether a real output stream is running
    pub fn is_device_backed(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Next stream error reported by the device callback, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    /// Stop the device stream and drop anything still queued
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.ring.clear();
    }
}

impl Drop for PlaybackOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
