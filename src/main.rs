// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{crate_version, Parser, Subcommand};
use pcmplay::audio;
use pcmplay::config::Playback;
use pcmplay::loader::FileLoader;
use pcmplay::player::{Player, PlayerInfo, PlayerStatus};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "An in-memory PCM audio player."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Loads a file and prints its format.
    Info {
        /// The audio file to inspect.
        path: PathBuf,
    },
    /// Plays a file through an output device.
    Play {
        /// The audio file to play.
        path: PathBuf,
        /// A YAML playback configuration.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// The device name to play through.
        #[arg(short, long)]
        device: Option<String>,
        /// The backend to use: auto, ring, streaming or simple.
        #[arg(short, long)]
        backend: Option<String>,
        /// Loop back to the start at the end of the file.
        #[arg(short = 'l', long = "loop")]
        loop_on_end: bool,
        /// Fill the device from the main thread instead of a playback thread.
        #[arg(long)]
        no_thread: bool,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Info { path } => {
            let loaded = FileLoader::default().load(&path)?;
            match PlayerInfo::of(&loaded) {
                Some(info) => println!("{}", info),
                None => println!("No audio data in {}.", path.display()),
            }
        }
        Commands::Play {
            path,
            config,
            device,
            backend,
            loop_on_end,
            no_thread,
        } => {
            let mut playback = match config {
                Some(config) => Playback::deserialize(&config)?,
                None => Playback::default(),
            };
            if let Some(device) = device {
                playback.set_device(&device);
            }
            if let Some(backend) = backend {
                playback.set_backend(&backend);
            }
            if loop_on_end {
                playback.set_loop_on_end(true);
            }
            if no_thread {
                playback.set_playback_thread(false);
            }

            let mut player = Player::from_config(&playback)?;
            player.load(&path)?;
            if let Some(info) = player.info() {
                println!("{}", info);
            }

            player.play()?;
            loop {
                match player.tick()? {
                    PlayerStatus::Playing => player.wait(Duration::from_millis(10)),
                    PlayerStatus::Finished(stats) => {
                        info!(
                            fills = stats.fills,
                            underruns = stats.underruns,
                            "Playback finished"
                        );
                        break;
                    }
                    PlayerStatus::Idle => break,
                }
            }
            player.release()?;
        }
    }

    Ok(())
}
