//! Host side: replays a recorded stream into the engine one batch at a time.
//!
//! The reader thread only chops the recording into batches and tags them with the
//! markers that fall inside; everything else happens on the engine thread.

use std::{
    fs,
    io::{self, Read},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crossbeam_channel::Sender;
use drf_slurper::timebase::TimeMarker;
use tracing::{debug, info};

/// A marker as logged against the absolute stream position
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoggedMarker {
    pub position: u64,
    pub epoch_seconds: u64,
    pub fraction_seconds: f64,
}

pub struct Batch {
    pub data: Vec<u8>,
    pub markers: Vec<TimeMarker>,
}

fn bad_line(n: usize, line: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("marker log line {}: can't parse {:?}", n + 1, line),
    )
}

/// Parse a marker log: one `position seconds fraction` triple per line, `#` comments allowed
pub fn parse_markers(text: &str) -> io::Result<Vec<LoggedMarker>> {
    let mut markers = vec![];
    for (n, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let mut next = || fields.next().ok_or_else(|| bad_line(n, line));
        let position = next()?.parse().map_err(|_| bad_line(n, line))?;
        let epoch_seconds = next()?.parse().map_err(|_| bad_line(n, line))?;
        let fraction_seconds: f64 = next()?.parse().map_err(|_| bad_line(n, line))?;
        if !(0.0..1.0).contains(&fraction_seconds) {
            return Err(bad_line(n, line));
        }
        markers.push(LoggedMarker {
            position,
            epoch_seconds,
            fraction_seconds,
        });
    }
    markers.sort_by_key(|m| m.position);
    Ok(markers)
}

pub fn read_markers(path: &Path) -> io::Result<Vec<LoggedMarker>> {
    parse_markers(&fs::read_to_string(path)?)
}

/// Read until `buf` is full or the source runs dry, returning the bytes read
fn fill(source: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Chop `source` into batches of `batch_frames` frames and send them on.
/// Returns the number of frames sent. Stops early if `stop` is raised or the
/// engine side hangs up.
pub fn replay(
    mut source: impl Read,
    markers: &[LoggedMarker],
    frame_bytes: usize,
    batch_frames: usize,
    sender: Sender<Batch>,
    stop: Arc<AtomicBool>,
) -> io::Result<u64> {
    let mut position = 0u64;
    let mut next_marker = 0;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let mut data = vec![0u8; frame_bytes * batch_frames];
        let read = fill(&mut source, &mut data)?;
        // Drop any trailing partial frame
        let frames = read / frame_bytes;
        if frames == 0 {
            break;
        }
        data.truncate(frames * frame_bytes);
        let end = position + frames as u64;
        let mut batch_markers = vec![];
        while next_marker < markers.len() && markers[next_marker].position < end {
            let m = markers[next_marker];
            if m.position >= position {
                batch_markers.push(TimeMarker::new(
                    (m.position - position) as usize,
                    m.epoch_seconds,
                    m.fraction_seconds,
                ));
            }
            next_marker += 1;
        }
        debug!(position, frames, markers = batch_markers.len(), "Replaying batch");
        if sender
            .send(Batch {
                data,
                markers: batch_markers,
            })
            .is_err()
        {
            break;
        }
        position = end;
    }
    info!(frames = position, "Replay finished");
    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_parse_markers() {
        let text = "# position seconds fraction\n2000 100 0.002\n\n0 100 0.0 # epoch\n";
        let markers = parse_markers(text).unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].position, 0);
        assert_eq!(markers[1].epoch_seconds, 100);
        assert!(parse_markers("12 100").is_err());
        assert!(parse_markers("12 100 1.5").is_err());
    }

    #[test]
    fn test_replay_batches_and_markers() {
        let data: Vec<u8> = (0..25u8).collect();
        let markers = parse_markers("0 1 0.0\n4 1 0.5\n11 2 0.0").unwrap();
        let (tx, rx) = unbounded();
        let sent = replay(
            &data[..],
            &markers,
            2,
            5,
            tx,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        // 12 whole frames, last byte dropped
        assert_eq!(sent, 12);
        let batches: Vec<Batch> = rx.iter().collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].markers, vec![TimeMarker::new(0, 1, 0.0), TimeMarker::new(4, 1, 0.5)]);
        assert!(batches[1].markers.is_empty());
        assert_eq!(batches[2].markers, vec![TimeMarker::new(1, 2, 0.0)]);
        assert_eq!(batches[2].data, vec![20, 21, 22, 23]);
    }
}
