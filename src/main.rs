//! midistream - Play a Standard MIDI File through a SoundFont synthesizer.
//!
//! A small front end for the streaming engine: merges the song's tracks,
//! streams them to the software device and takes keyboard control in the
//! terminal.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- --soundfont font.sf2 song.mid
//! cargo run -- -sf font.sf2 --once --volume 8 song.mid
//! ```
//!
//! Keys: `space` pause/resume, `+`/`-` volume, `s` stop, `p` play, `q` quit.

use midistream::{EngineConfig, MidiDevice, MusicEngine, PlaybackState, SynthDevice};

use anyhow::{bail, Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, Clear, ClearType};
use std::io::{self, Write};
use std::path::PathBuf;

/// Command-line options for the player.
struct CliOptions {
    /// The MIDI file to play.
    song: PathBuf,
    /// Path to the SoundFont file.
    soundfont: PathBuf,
    /// Optional engine configuration file (JSON).
    config: Option<PathBuf>,
    /// Play the song once instead of looping.
    once: bool,
    /// Initial volume level.
    volume: Option<u32>,
}

impl CliOptions {
    /// Parses command-line arguments.
    ///
    /// Supports:
    /// - `--soundfont <path>` or `-sf <path>`: SoundFont file (required)
    /// - `--config <path>` or `-c <path>`: Engine configuration file
    /// - `--once` or `-1`: Play once instead of looping
    /// - `--volume <level>` or `-v <level>`: Initial volume level
    /// - `--help` or `-h`: Print help and exit
    /// - a positional `.sf2` path is taken as the SoundFont, any other
    ///   positional path as the song
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut song: Option<PathBuf> = None;
        let mut soundfont: Option<PathBuf> = None;
        let mut config: Option<PathBuf> = None;
        let mut once = false;
        let mut volume: Option<u32> = None;
        let mut i = 1;

        while i < args.len() {
            match args[i].as_str() {
                "--soundfont" | "-sf" => {
                    i += 1;
                    let path = args.get(i).context("--soundfont requires a path argument")?;
                    soundfont = Some(PathBuf::from(path));
                }
                "--config" | "-c" => {
                    i += 1;
                    let path = args.get(i).context("--config requires a path argument")?;
                    config = Some(PathBuf::from(path));
                }
                "--once" | "-1" => once = true,
                "--volume" | "-v" => {
                    i += 1;
                    let level = args.get(i).context("--volume requires a level argument")?;
                    volume = Some(
                        level
                            .parse()
                            .with_context(|| format!("Invalid volume level: {}", level))?,
                    );
                }
                "--help" | "-h" => {
                    print_help(args.first().map(String::as_str).unwrap_or("midistream"));
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
                other if other.ends_with(".sf2") => soundfont = Some(PathBuf::from(other)),
                other => song = Some(PathBuf::from(other)),
            }
            i += 1;
        }

        let Some(song) = song else {
            bail!("No MIDI file given (use --help for usage information)");
        };
        let Some(soundfont) = soundfont else {
            bail!("No SoundFont given (use --soundfont PATH)");
        };

        Ok(Self {
            song,
            soundfont,
            config,
            once,
            volume,
        })
    }
}

fn print_help(program: &str) {
    eprintln!("midistream - Stream a MIDI file to a SoundFont synthesizer");
    eprintln!();
    eprintln!("Usage: {} [OPTIONS] --soundfont PATH SONG.mid", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -sf, --soundfont PATH  SoundFont file (.sf2) to play with");
    eprintln!("  -c, --config PATH      Engine configuration (JSON)");
    eprintln!("  -1, --once             Play once instead of looping");
    eprintln!("  -v, --volume LEVEL     Initial volume level (0 mutes)");
    eprintln!("  -h, --help             Print this help message");
    eprintln!();
    eprintln!("Keys: space pause/resume, +/- volume, s stop, p play, q quit");
}

/// Main entry point.
fn main() -> Result<()> {
    // Parse CLI options first (before any terminal setup)
    let cli = CliOptions::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let data = std::fs::read(&cli.song)
        .with_context(|| format!("Failed to read {}", cli.song.display()))?;
    let device = SynthDevice::new(&cli.soundfont).context("Failed to load SoundFont")?;

    let mut engine = MusicEngine::new(device, config);
    engine.init().context("Failed to open MIDI output")?;
    engine
        .register_song(&data)
        .with_context(|| format!("Failed to load song {}", cli.song.display()))?;

    let max_level = engine.config().max_volume_level;
    let mut level = cli.volume.unwrap_or(max_level).min(max_level);
    engine.set_volume(level).context("Failed to set volume")?;

    let looping = !cli.once;
    engine.play_song(looping).context("Failed to start playback")?;
    println!(
        "Playing {} ({} events{})",
        cli.song.display(),
        engine.song_len(),
        if looping { ", looping" } else { "" }
    );

    enable_raw_mode().context("Failed to enable raw mode")?;
    let result = run_controls(&mut engine, &mut level, looping);
    disable_raw_mode().context("Failed to disable raw mode")?;
    println!();

    let shutdown = engine.shutdown_music();
    result?;
    shutdown.context("Failed to shut down music engine")?;
    Ok(())
}

/// Handles keyboard input until the user quits.
fn run_controls<D: MidiDevice>(
    engine: &mut MusicEngine<D>,
    level: &mut u32,
    looping: bool,
) -> Result<()> {
    let max_level = engine.config().max_volume_level;
    print_status(engine, *level)?;

    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        let outcome = match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
            KeyCode::Char(' ') => match engine.playback_state() {
                PlaybackState::Playing => engine.pause_song(),
                PlaybackState::Paused => engine.resume_song(),
                _ => Ok(()),
            },
            KeyCode::Char('+') | KeyCode::Char('=') => {
                *level = (*level + 1).min(max_level);
                engine.set_volume(*level)
            }
            KeyCode::Char('-') => {
                *level = level.saturating_sub(1);
                engine.set_volume(*level)
            }
            KeyCode::Char('s') => engine.stop_song(),
            KeyCode::Char('p') => engine.play_song(looping),
            _ => continue,
        };

        // Already logged by the engine; keep the player running
        if let Err(e) = outcome {
            tracing::warn!("{}", e);
        }
        print_status(engine, *level)?;
    }

    Ok(())
}

/// Redraws the one-line status display.
fn print_status<D: MidiDevice>(engine: &MusicEngine<D>, level: u32) -> Result<()> {
    let state = match engine.playback_state() {
        PlaybackState::Playing => "playing",
        PlaybackState::Paused => "paused",
        PlaybackState::Registered => "stopped",
        PlaybackState::Opened => "no song",
        PlaybackState::Closed => "closed",
    };
    let position = engine
        .song_position()
        .map(|pos| format!("{}/{}", pos, engine.song_len()))
        .unwrap_or_else(|| "-".to_string());

    let mut stdout = io::stdout();
    execute!(stdout, Clear(ClearType::CurrentLine))?;
    write!(
        stdout,
        "\r[{}] volume {}/{} ({:.2})  position {}",
        state,
        level,
        engine.config().max_volume_level,
        engine.volume_scale(),
        position
    )?;
    stdout.flush()?;
    Ok(())
}
