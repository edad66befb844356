use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::{Result, StageStatus};
use crate::sink::AuxSink;
use crate::source::SharedSource;

use super::{Backend, OutputQueue, PipelineItem, PipelineStage, StageKind};

/// Forwards video untouched while moving demultiplexed audio/subtitle packets from
/// the source to their sinks.
pub struct AudioStage {
    source: SharedSource,
    sinks: HashMap<usize, Box<dyn AuxSink>>,
    queue: OutputQueue,
    packets: u64,
    finished: bool,
}

impl AudioStage {
    pub fn new(source: SharedSource, sinks: HashMap<usize, Box<dyn AuxSink>>) -> Self {
        Self {
            source,
            sinks,
            queue: OutputQueue::default(),
            packets: 0,
            finished: false,
        }
    }

    pub fn packets_written(&self) -> u64 {
        self.packets
    }

    fn pump(&mut self) -> Result<()> {
        let packets = self.source.lock().take_aux_packets();
        for packet in packets {
            match self.sinks.get_mut(&packet.stream) {
                Some(sink) => {
                    sink.write_packet(&packet)?;
                    self.packets += 1;
                }
                None => trace!(stream = packet.stream, "Packet for unmapped stream skipped"),
            }
        }
        Ok(())
    }
}

impl PipelineStage for AudioStage {
    fn name(&self) -> &str {
        "audio"
    }

    fn kind(&self) -> StageKind {
        StageKind::Audio
    }

    fn backend(&self) -> Backend {
        Backend::Host
    }

    fn is_pass_through(&self) -> bool {
        true
    }

    fn send(&mut self, input: Option<PipelineItem>) -> Result<StageStatus> {
        self.pump()?;
        match input {
            Some(item) => {
                self.queue.push(item);
                Ok(StageStatus::Ok)
            }
            None => {
                if !self.finished {
                    for sink in self.sinks.values_mut() {
                        sink.finish()?;
                    }
                    self.finished = true;
                    debug!(packets = self.packets, streams = self.sinks.len(), "Auxiliary streams finished");
                }
                Ok(if self.queue.is_empty() {
                    StageStatus::EndOfStream
                } else {
                    StageStatus::Ok
                })
            }
        }
    }

    fn drain(&mut self, _sync: bool) -> Result<Vec<PipelineItem>> {
        Ok(self.queue.drain(true))
    }

    fn output_count(&self) -> u64 {
        self.queue.emitted()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::source::{AuxPacket, InputInfo, VideoSource, shared};
    use crate::video::{FrameShape, PixelFormat, Rational, TrimParam};

    struct DemuxSource {
        info: InputInfo,
        packets: Vec<AuxPacket>,
    }

    impl VideoSource for DemuxSource {
        fn info(&self) -> &InputInfo {
            &self.info
        }

        fn trim(&self) -> Option<&TrimParam> {
            None
        }

        fn set_trim(&mut self, _trim: TrimParam) {}

        fn take_aux_packets(&mut self) -> Vec<AuxPacket> {
            std::mem::take(&mut self.packets)
        }

        fn message(&self) -> String {
            "demux".into()
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<(Vec<i64>, bool)>>);

    impl AuxSink for Recorder {
        fn write_packet(&mut self, packet: &AuxPacket) -> Result<()> {
            self.0.lock().0.push(packet.pts);
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.0.lock().1 = true;
            Ok(())
        }
    }

    #[test]
    fn routes_packets_by_stream_and_finishes_sinks() {
        let packets = vec![
            AuxPacket { stream: 1, pts: 10, data: vec![1] },
            AuxPacket { stream: 2, pts: 11, data: vec![2] },
            AuxPacket { stream: 1, pts: 12, data: vec![3] },
        ];
        let source = shared(DemuxSource {
            info: InputInfo::raw(FrameShape::new(2, 2, PixelFormat::Nv12), Rational::new(30, 1)),
            packets,
        });
        let recorder = Recorder::default();
        let mut sinks: HashMap<usize, Box<dyn AuxSink>> = HashMap::new();
        sinks.insert(1, Box::new(recorder.clone()));
        let mut stage = AudioStage::new(source, sinks);
        assert_eq!(stage.send(None).unwrap(), StageStatus::EndOfStream);
        let state = recorder.0.lock();
        assert_eq!(state.0, vec![10, 12]);
        assert!(state.1);
        assert_eq!(stage.packets_written(), 2);
    }
}
