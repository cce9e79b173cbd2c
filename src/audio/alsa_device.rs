//! ALSA PCM devices for capture and playback.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use super::device::{AudioSink, AudioSource, DeviceProvider, run_blocking};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
    /// Ring buffer size in frames
    pub buffer_size: usize,
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    buffer_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        if let Some(bs) = buffer_size {
            hwp.set_buffer_size_near(bs as alsa::pcm::Frames)?;
        }
        pcm.hw_params(&hwp)
            .with_context(|| format!("Device '{}' rejected {}Hz/{}ch S16LE", device, sample_rate, channels))?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as usize,
        }
    };

    if params.channels != channels {
        anyhow::bail!(
            "Device '{}' negotiated {} channels instead of {}",
            device,
            params.channels,
            channels
        );
    }
    if params.sample_rate != sample_rate {
        log::warn!(
            "Device '{}' runs at {}Hz, requested {}Hz",
            device,
            params.sample_rate,
            sample_rate
        );
    }

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}, buffer_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
        params.buffer_size,
    );

    Ok((pcm, params))
}

/// ALSA microphone.
pub struct AlsaSource {
    pcm: PCM,
    params: AlsaParams,
}

impl AudioSource for AlsaSource {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        let io = self.pcm.io_i16()?;
        match io.readi(buf) {
            Ok(frames) => Ok(frames * self.params.channels as usize),
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                self.pcm
                    .prepare()
                    .context("Failed to recover PCM capture")?;
                Ok(0)
            }
        }
    }

    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn channels(&self) -> u8 {
        self.params.channels as u8
    }

    fn buffer_len(&self) -> usize {
        self.params.period_size * self.params.channels as usize
    }
}

/// ALSA output, either the loopback cable or a speaker.
pub struct AlsaSink {
    pcm: PCM,
    params: AlsaParams,
    is_virtual: bool,
}

impl AlsaSink {
    fn write_blocking(&self, samples: &[i16]) -> Result<()> {
        let io = self.pcm.io_i16()?;
        let channels = self.params.channels as usize;
        let total_frames = samples.len() / channels;
        let mut frames_written = 0;
        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&samples[offset..total_frames * channels]) {
                Ok(n) => frames_written += n,
                Err(e) => {
                    log::warn!("ALSA playback error: {}, recovering...", e);
                    self.pcm
                        .prepare()
                        .context("Failed to recover PCM playback")?;
                }
            }
        }
        Ok(())
    }
}

impl AudioSink for AlsaSink {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        run_blocking(|| self.write_blocking(samples))
    }

    fn queued_ms(&self) -> Option<u64> {
        let frames = self.pcm.delay().ok()?.max(0) as u64;
        Some(frames * 1000 / u64::from(self.params.sample_rate.max(1)))
    }

    fn flush(&mut self) -> Result<()> {
        self.pcm.drop().context("Failed to drop queued playback")?;
        self.pcm.prepare().context("Failed to re-prepare playback")?;
        Ok(())
    }

    fn is_virtual(&self) -> bool {
        self.is_virtual
    }
}

/// Device names used to open ALSA endpoints.
#[derive(Debug, Clone)]
pub struct AlsaDevices {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// Speaker used when the virtual cable is missing
    pub playback_device: String,
    /// Virtual cable the consumer feeds (e.g. "hw:Loopback,0"); empty to skip
    pub virtual_device: String,
}

impl DeviceProvider for AlsaDevices {
    fn open_source(&self, sample_rate: u32, channels: u8) -> Result<Box<dyn AudioSource>> {
        let period = (sample_rate / 50).max(1) as usize;
        let opened = open_pcm(
            &self.capture_device,
            Direction::Capture,
            sample_rate,
            u32::from(channels),
            Some(period),
            None,
        );
        let (pcm, params) = match opened {
            Ok(ok) => ok,
            Err(e) if self.capture_device != "default" => {
                log::warn!("{:#}; falling back to the default capture device", e);
                open_pcm("default", Direction::Capture, sample_rate, u32::from(channels), Some(period), None)?
            }
            Err(e) => return Err(e),
        };
        Ok(Box::new(AlsaSource { pcm, params }))
    }

    fn open_sink(
        &self,
        sample_rate: u32,
        channels: u8,
        buffer_bytes: usize,
    ) -> Result<Box<dyn AudioSink>> {
        let buffer_frames = buffer_bytes / (usize::from(channels.max(1)) * 2);
        let open = |device: &str| {
            open_pcm(
                device,
                Direction::Playback,
                sample_rate,
                u32::from(channels),
                None,
                Some(buffer_frames),
            )
        };

        if !self.virtual_device.is_empty() {
            match open(&self.virtual_device) {
                Ok((pcm, params)) => {
                    return Ok(Box::new(AlsaSink {
                        pcm,
                        params,
                        is_virtual: true,
                    }));
                }
                Err(e) => log::warn!("Virtual output unavailable ({:#}), using speakers", e),
            }
        }

        let (pcm, params) = open(&self.playback_device)?;
        Ok(Box::new(AlsaSink {
            pcm,
            params,
            is_virtual: false,
        }))
    }
}
