use anyhow::{Context, Result, bail};
use plughost_engine::{PluginDescriptor, PluginInstance, Vst3Host};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const NOTE_VELOCITY: i32 = 100;

fn load(host: &Vst3Host, bundle: &Path) -> Result<PluginInstance> {
    host.load(bundle)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("Failed to load {}", bundle.display()))
}

pub fn scan(host: &Vst3Host, dirs: &[PathBuf], json: bool) -> Result<()> {
    let mut found: Vec<PluginDescriptor> = Vec::new();
    if dirs.is_empty() {
        host.scan_standard_locations(|descriptor| found.push(descriptor));
    } else {
        for dir in dirs {
            if host.scan(dir, |descriptor| found.push(descriptor)) == 0 && !dir.is_dir() {
                warn!("{}", host.last_error());
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }
    for plugin in &found {
        let kind = match (plugin.is_instrument, plugin.is_effect) {
            (true, true) => "inst+fx",
            (true, false) => "inst",
            (false, true) => "fx",
            (false, false) => "-",
        };
        println!(
            "{:<7} {:<32} {:<24} {}",
            kind, plugin.name, plugin.vendor, plugin.path
        );
    }
    info!("{} plugin(s) found", found.len());
    Ok(())
}

pub fn probe(host: &Vst3Host, bundle: &Path) -> Result<()> {
    let plugin = load(host, bundle)?;
    let info = plugin.plugin_info();
    println!("Name:       {}", info.name);
    println!("Vendor:     {}", info.vendor);
    println!("Version:    {}", info.version);
    println!("Category:   {}", info.category);
    println!("Class ID:   {}", info.class_id);
    println!(
        "Kind:       instrument={} effect={}",
        info.is_instrument, info.is_effect
    );

    let (audio_in, audio_out) = plugin.audio_bus_counts();
    let (event_in, event_out) = plugin.event_bus_counts();
    println!("Audio buses: {audio_in} in, {audio_out} out");
    println!("Event buses: {event_in} in, {event_out} out");
    let (inputs, outputs) = plugin.audio_buses();
    for bus in inputs.iter().chain(outputs.iter()) {
        println!("  [{}] {} ({} ch)", bus.index, bus.name, bus.channel_count);
    }

    println!("Controller: {}", plugin.has_controller());
    println!("Editor:     {}", plugin.has_editor());

    let parameters = plugin.parameters();
    println!("Parameters: {}", parameters.len());
    for param in &parameters {
        let value = plugin.get_parameter(param.id).unwrap_or(param.default_value);
        let steps = if param.is_discrete() {
            format!(" steps={}", param.step_count)
        } else {
            String::new()
        };
        println!(
            "  {:>6} {:<28} {:.4} {}{}",
            param.id, param.title, value, param.units, steps
        );
    }

    plugin.unload();
    Ok(())
}

pub fn render(
    host: &Vst3Host,
    bundle: &Path,
    frames: usize,
    out: Option<&Path>,
    note: Option<u8>,
) -> Result<()> {
    let config = host.config();
    let sample_rate = config.sample_rate;
    let block = config.max_block_size;

    let mut plugin = load(host, bundle)?;
    plugin
        .initialize(sample_rate, block)
        .map_err(anyhow::Error::msg)?;
    plugin.activate().map_err(anyhow::Error::msg)?;

    if let Some(pitch) = note {
        plugin
            .queue_midi_event(0, 0, i32::from(pitch), NOTE_VELOCITY, 0)
            .map_err(anyhow::Error::msg)?;
    }
    let note_off_at = frames / 2;

    let silence = vec![0.0f32; block];
    let mut left = vec![0.0f32; block];
    let mut right = vec![0.0f32; block];
    let mut interleaved = Vec::with_capacity(frames * 2);
    let mut peak = 0.0f32;

    let mut rendered = 0;
    while rendered < frames {
        let n = block.min(frames - rendered);
        if let Some(pitch) = note {
            if (rendered..rendered + n).contains(&note_off_at) {
                let offset = (note_off_at - rendered) as i32;
                plugin
                    .queue_midi_event(1, 0, i32::from(pitch), 0, offset)
                    .map_err(anyhow::Error::msg)?;
            }
        }

        if let Err(e) = plugin.process(&silence, &silence, &mut left, &mut right, n) {
            bail!("Processing failed after {rendered} frames: {e}");
        }
        for (&l, &r) in left[..n].iter().zip(&right[..n]) {
            peak = peak.max(l.abs()).max(r.abs());
            interleaved.push(l);
            interleaved.push(r);
        }
        rendered += n;

        let flags = host.take_restart_flags();
        if flags != 0 {
            plugin.handle_restart(flags).map_err(anyhow::Error::msg)?;
        }
    }

    plugin.deactivate().map_err(anyhow::Error::msg)?;
    plugin.unload();

    let peak_db = if peak > 0.0 {
        20.0 * peak.log10()
    } else {
        f32::NEG_INFINITY
    };
    println!("Rendered {rendered} frames at {sample_rate} Hz, peak {peak:.6} ({peak_db:.1} dBFS)");

    if let Some(path) = out {
        wavers::write::<f32, _>(path, &interleaved, sample_rate.round() as i32, 2)
            .map_err(|e| anyhow::anyhow!("Failed to write '{}': {e}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

pub fn save_state(host: &Vst3Host, bundle: &Path, file: &Path) -> Result<()> {
    let plugin = load(host, bundle)?;
    let blob = plugin.save_state().map_err(anyhow::Error::msg)?;
    fs::write(file, &blob).with_context(|| format!("Failed to write {}", file.display()))?;
    println!("Saved {} bytes of state to {}", blob.len(), file.display());
    plugin.unload();
    Ok(())
}

pub fn load_state(host: &Vst3Host, bundle: &Path, file: &Path) -> Result<()> {
    let blob = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let mut plugin = load(host, bundle)?;
    plugin.set_state(&blob).map_err(anyhow::Error::msg)?;
    println!("Restored {} bytes of state into '{}'", blob.len(), plugin.plugin_info().name);
    for param in plugin.parameters() {
        if let Ok(value) = plugin.get_parameter(param.id) {
            println!("  {:>6} {:<28} {:.4}", param.id, param.title, value);
        }
    }
    plugin.unload();
    Ok(())
}
