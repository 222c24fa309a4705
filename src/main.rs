//! Attys scanner command line tool
//!
//! Scans for Attys data loggers, connects them over Bluetooth and prints
//! their samples or records them to a file.

use std::{
   io::{self, Write},
   path::{Path, PathBuf},
   sync::Arc,
   time::Duration,
};

use clap::Parser;
use log::{error, info, warn};
use smol_str::SmolStr;
use strum::IntoEnumIterator;
use tokio::{signal, time};

use attysscan::{
   AttysScan, BluezBackend, Channel, CommMessage, Config, Result, Sample, ScanStatus, ScannedAttys,
   Separator,
};

/// How often the ring buffers are drained
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Time a device gets to shut down cleanly
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "attysscan", version, about)]
struct Args {
   /// Maximum number of Attys to connect
   #[arg(long)]
   max: Option<usize>,

   /// RFCOMM channel of the serial port
   #[arg(long)]
   channel: Option<u8>,

   /// Stop after this many samples per device
   #[arg(long)]
   samples: Option<u64>,

   /// Record to this file instead of printing samples
   #[arg(long)]
   record: Option<PathBuf>,

   /// Column separator of the recording
   #[arg(long, default_value_t = Separator::Tab)]
   separator: Separator,

   /// Only look at devices BlueZ already knows
   #[arg(long)]
   no_inquiry: bool,

   /// Bluetooth adapter to use, e.g. hci0
   #[arg(long)]
   adapter: Option<SmolStr>,
}

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
   let args = Args::parse();

   // Load configuration
   let mut config = Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );
   if let Some(max) = args.max {
      config.scan.max_devices = max;
   }
   if let Some(channel) = args.channel {
      config.scan.rfcomm_channel = channel;
   }
   if args.no_inquiry {
      config.scan.inquiry_secs = 0;
   }
   if args.adapter.is_some() {
      config.scan.adapter.clone_from(&args.adapter);
   }

   let backend = BluezBackend::new().await?;
   let mut scan = AttysScan::new(backend, config.scan.clone())
      .with_known_devices(config.known_addresses())
      .with_attys_settings(config.attys);
   scan.register_listener(Arc::new(|status: ScanStatus, text: &str| {
      let text = text.replace('\n', " ");
      if status.is_error() {
         warn!("{text}");
      } else {
         info!("{text}");
      }
   }));

   if scan.scan().await? == 0 {
      warn!("No Attys connected");
      return Ok(());
   }

   for device in scan.devices() {
      info!("{} ({})", device.display_name, device.address);
      start_device(device, &args, scan.len())?;
   }

   if args.record.is_none() {
      print_header();
   }
   stream(&scan, &args).await?;

   info!("Shutting down...");
   scan.quit_all();
   for device in scan.devices() {
      if time::timeout(SHUTDOWN_TIMEOUT, device.comm.wait()).await.is_err() {
         warn!("{}: did not shut down in time", device.display_name);
      }
   }
   Ok(())
}

fn start_device(device: &ScannedAttys, args: &Args, count: usize) -> Result<()> {
   let name = device.display_name.clone();
   device
      .comm
      .register_message_listener(Arc::new(move |msg: CommMessage| match msg {
         CommMessage::Error => error!("{name}: {msg}"),
         CommMessage::Retry => warn!("{name}: {msg}"),
         _ => info!("{name}: {msg}"),
      }));

   if let Some(path) = &args.record {
      let path = if count > 1 {
         indexed_path(path, device.index)
      } else {
         path.clone()
      };
      device.comm.recorder().set_separator(args.separator);
      device.comm.start_recording(path)?;
   }
   device.comm.start()
}

/// `data.tsv` becomes `data_1.tsv` for the second device.
fn indexed_path(path: &Path, index: usize) -> PathBuf {
   let stem = path.file_stem().unwrap_or_default().to_string_lossy();
   let name = match path.extension() {
      Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
      None => format!("{stem}_{index}"),
   };
   path.with_file_name(name)
}

fn print_header() {
   let mut line = String::from("device\ttime");
   for ch in Channel::iter() {
      line.push('\t');
      line.push_str(ch.short_description());
   }
   println!("{line}");
}

fn print_sample(out: &mut impl Write, index: usize, time: f64, sample: &Sample) -> io::Result<()> {
   write!(out, "{index}\t{time:.4}")?;
   for v in sample {
      write!(out, "\t{v:.6}")?;
   }
   writeln!(out)
}

/// Drains the ring buffers until Ctrl-C, the sample limit or until every
/// device has stopped.
async fn stream(scan: &AttysScan<BluezBackend>, args: &Args) -> Result<()> {
   let mut printed = vec![0u64; scan.len()];
   let mut ticker = time::interval(POLL_INTERVAL);

   loop {
      tokio::select! {
         r = signal::ctrl_c() => {
            r?;
            info!("Interrupted");
            return Ok(());
         }
         _ = ticker.tick() => {}
      }

      // checked before draining so the last samples are still printed
      let stopped = scan.devices().iter().all(|d| !d.comm.is_running());
      let mut out = io::stdout().lock();
      for (device, count) in scan.devices().iter().zip(printed.iter_mut()) {
         let rate = f64::from(device.comm.sampling_rate_hz());
         while args.samples.is_none_or(|limit| *count < limit)
            && let Some(sample) = device.comm.sample_from_buffer()
         {
            if args.record.is_none() {
               print_sample(&mut out, device.index, *count as f64 / rate, &sample)?;
            }
            *count += 1;
         }
      }
      out.flush()?;
      drop(out);

      if let Some(limit) = args.samples
         && printed.iter().all(|n| *n >= limit)
      {
         info!("Got {limit} samples from every device");
         return Ok(());
      }
      if stopped {
         if scan.devices().iter().all(|d| d.comm.has_fatal_error()) {
            error!("All devices failed");
         } else {
            warn!("All devices disconnected");
         }
         return Ok(());
      }
   }
}
