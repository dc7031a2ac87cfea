use std::{
    fs::{self, File},
    io::BufReader,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use clap::Parser;
use crossbeam_channel::{bounded, Receiver};
use drf_slurper::{
    archive::{Archive, FileArchive},
    engine::{BatchOutcome, CaptureEngine},
    error::CaptureResult,
};
use tracing::{error, info, warn};

mod args;
mod capture;

use args::{convert_filter, Args};
use capture::Batch;

/// Feed batches to the engine until the stream ends, we're told to stop, or it fails
fn drive<A: Archive>(
    engine: &mut CaptureEngine<A>,
    receiver: &Receiver<Batch>,
    stop: &AtomicBool,
) -> CaptureResult<()> {
    for batch in receiver {
        if stop.load(Ordering::Relaxed) {
            warn!("Stop requested, closing archive");
            break;
        }
        if engine.process(&batch.data, &batch.markers)? == BatchOutcome::Stopped {
            info!("Dropped packet, stopped as requested");
            return Ok(());
        }
    }
    engine.close()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let config = args.capture_config();
    let format = config.validate()?;
    info!(dir = %config.directory.display(), "Writing archive");
    fs::create_dir_all(&config.directory)?;
    let archive = FileArchive::new(
        &config.directory,
        config.subdir_cadence_s,
        config.file_cadence_ms,
    );
    let mut engine = CaptureEngine::new(&config, archive)?;

    let markers = capture::read_markers(&args.markers)?;
    let source = BufReader::new(File::open(&args.input)?);

    // Ctrl-C closes the archive cleanly
    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::Relaxed))?;

    let (sender, receiver) = bounded(args.capacity);
    let reader_stop = stop.clone();
    let frame_bytes = format.frame_bytes();
    let batch_size = args.batch_size;
    let reader = thread::spawn(move || {
        capture::replay(source, &markers, frame_bytes, batch_size, sender, reader_stop)
    });

    let result = drive(&mut engine, &receiver, &stop);
    // Hang up so the reader doesn't block on a full channel
    drop(receiver);
    stop.store(true, Ordering::Relaxed);
    let replayed = reader
        .join()
        .map_err(|_| "sample reader thread panicked")??;

    info!(frames = replayed, "{}", engine.stats());
    if let Err(e) = result {
        error!("{}", e);
        return Err(e.into());
    }
    Ok(())
}
