use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::source::AuxPacket;
use crate::video::{BitstreamUnit, FrameBuffer, FrameMeta};

/// Destination of the pipeline's final items.
pub trait OutputSink: Send {
    /// Writes and clears `unit`.
    fn write_bitstream(&mut self, unit: &mut BitstreamUnit) -> Result<()>;

    /// Raw picture output, used when no encoder is configured.
    fn write_frame(&mut self, frame: &FrameBuffer, meta: &FrameMeta) -> Result<()> {
        let _ = (frame, meta);
        Err(PipelineError::Output(
            "sink does not accept raw pictures".into(),
        ))
    }

    /// Blocks until everything handed over is durable.
    fn wait_for_completion(&mut self) -> Result<()>;

    fn message(&self) -> String;
}

fn output_error(path: &Path, err: std::io::Error) -> PipelineError {
    PipelineError::Output(format!("{}: {err}", path.display()))
}

/// Writes units, or raw planes, back to back into one file.
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
    units: u64,
    bytes: u64,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| output_error(parent, err))?;
        }
        let file = File::create(path).map_err(|err| output_error(path, err))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            units: 0,
            bytes: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

impl OutputSink for FileSink {
    fn write_bitstream(&mut self, unit: &mut BitstreamUnit) -> Result<()> {
        self.writer
            .write_all(unit.data())
            .map_err(|err| output_error(&self.path, err))?;
        self.units += 1;
        self.bytes += unit.size() as u64;
        unit.clear();
        Ok(())
    }

    fn write_frame(&mut self, frame: &FrameBuffer, _meta: &FrameMeta) -> Result<()> {
        for plane in 0..frame.plane_count() {
            let rows = frame.plane_size(plane).1;
            for y in 0..rows {
                let row = frame.row(plane, y);
                self.writer
                    .write_all(row)
                    .map_err(|err| output_error(&self.path, err))?;
                self.bytes += row.len() as u64;
            }
        }
        self.units += 1;
        Ok(())
    }

    fn wait_for_completion(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|err| output_error(&self.path, err))?;
        debug!(path = %self.path.display(), units = self.units, bytes = self.bytes, "Output flushed");
        Ok(())
    }

    fn message(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Everything a [`MemorySink`] received.
#[derive(Debug, Default)]
pub struct Captured {
    pub units: Vec<BitstreamUnit>,
    pub frames: Vec<FrameMeta>,
    pub frame_bytes: Vec<Vec<u8>>,
    pub completed: bool,
}

/// Keeps output in memory behind a shared handle.
#[derive(Clone, Default)]
pub struct MemorySink {
    captured: Arc<Mutex<Captured>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) -> Arc<Mutex<Captured>> {
        self.captured.clone()
    }
}

impl OutputSink for MemorySink {
    fn write_bitstream(&mut self, unit: &mut BitstreamUnit) -> Result<()> {
        self.captured.lock().units.push(unit.clone());
        unit.clear();
        Ok(())
    }

    fn write_frame(&mut self, frame: &FrameBuffer, meta: &FrameMeta) -> Result<()> {
        let mut bytes = Vec::new();
        for plane in 0..frame.plane_count() {
            for y in 0..frame.plane_size(plane).1 {
                bytes.extend_from_slice(frame.row(plane, y));
            }
        }
        let mut captured = self.captured.lock();
        captured.frames.push(meta.clone());
        captured.frame_bytes.push(bytes);
        Ok(())
    }

    fn wait_for_completion(&mut self) -> Result<()> {
        self.captured.lock().completed = true;
        Ok(())
    }

    fn message(&self) -> String {
        "memory".to_string()
    }
}

/// Consumer of one demultiplexed audio or subtitle stream.
pub trait AuxSink: Send {
    fn write_packet(&mut self, packet: &AuxPacket) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Appends packet payloads of one stream to a file.
pub struct FileAuxSink {
    path: PathBuf,
    writer: BufWriter<File>,
    packets: u64,
}

impl FileAuxSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|err| output_error(path, err))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            packets: 0,
        })
    }
}

impl AuxSink for FileAuxSink {
    fn write_packet(&mut self, packet: &AuxPacket) -> Result<()> {
        self.writer
            .write_all(&packet.data)
            .map_err(|err| output_error(&self.path, err))?;
        self.packets += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|err| output_error(&self.path, err))?;
        debug!(path = %self.path.display(), packets = self.packets, "Auxiliary stream finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{FrameShape, MemoryDomain, PixelFormat};

    #[test]
    fn file_sink_writes_and_clears_units() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.rfv");
        let mut sink = FileSink::create(&path).unwrap();
        let mut unit = BitstreamUnit::from_slice(b"abc", 0, 0);
        sink.write_bitstream(&mut unit).unwrap();
        assert!(unit.is_empty());
        let mut unit = BitstreamUnit::from_slice(b"de", 1, 1);
        sink.write_bitstream(&mut unit).unwrap();
        sink.wait_for_completion().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcde");
        assert_eq!(sink.bytes_written(), 5);
    }

    #[test]
    fn raw_frames_are_written_without_stride_padding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.yuv");
        let shape = FrameShape::new(4, 2, PixelFormat::Nv12);
        let mut frame = FrameBuffer::allocate(shape, MemoryDomain::System).unwrap();
        frame.fill(16, 128, 128);
        let mut sink = FileSink::create(&path).unwrap();
        sink.write_frame(&frame, &FrameMeta::default()).unwrap();
        sink.wait_for_completion().unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 12);
    }
}
