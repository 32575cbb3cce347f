//! # DirectLink Loopback
//!
//! Two endpoints on one in-process hub: an editor publishing a small
//! scene and a viewer reconstructing it. One live edit follows the
//! initial sync.
//!
//! ## Usage
//!
//! ```bash
//! directlink_loopback --duration-ms 3000
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use directlink::scene::ParameterValue;
use directlink::{
    Endpoint, EndpointConfig, LocalHub, MemoryScene, MemorySceneProvider, SceneNode, SceneProvider,
};

fn main() {
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         DIRECTLINK LOOPBACK                                      ║");
    println!("║         EDITOR → VIEWER SCENE SYNC                               ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let args: Vec<String> = std::env::args().collect();
    let mut duration_ms = 3000u64;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--duration-ms" | "-d" => {
                if i + 1 < args.len() {
                    duration_ms = args[i + 1].parse().unwrap_or(3000);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Usage: directlink_loopback [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --duration-ms <MS>     Time allowed for each sync step (default: 3000)");
                println!("  -h, --help                 Show this help");
                return;
            }
            _ => {}
        }
        i += 1;
    }
    let timeout = Duration::from_millis(duration_ms);

    let config = EndpointConfig {
        heartbeat_interval_ms: 100,
        tick_wait_ms: 5,
        ..EndpointConfig::default()
    };

    let hub = LocalHub::new();
    let editor = match Endpoint::new("editor", Arc::new(hub.connect()), config.clone()) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            eprintln!("failed to start editor: {e}");
            std::process::exit(1);
        }
    };
    let viewer = match Endpoint::new("viewer", Arc::new(hub.connect()), config) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            eprintln!("failed to start viewer: {e}");
            std::process::exit(1);
        }
    };

    // Editor scene: a root referencing three props
    let mut scene = MemoryScene::new("level");
    let root = scene.create_node("root");
    let props: [(&str, [f32; 3]); 3] = [
        ("crate", [0.0, 0.0, 0.0]),
        ("lamp", [2.0, 0.0, 1.0]),
        ("door", [5.0, 0.0, 0.0]),
    ];
    for (name, position) in props {
        let prop = scene.create_node(name);
        prop.set_parameter("position", position);
        root.add_reference("children", &prop);
    }

    let source = editor.add_source("level", true);
    let provider = Arc::new(MemorySceneProvider::new());
    let viewer_provider: Arc<dyn SceneProvider> = provider.clone();
    viewer.add_destination("level", true, viewer_provider);

    let root_node: Arc<dyn SceneNode> = root.clone();
    editor.set_source_root(source, Some(root_node));
    editor.snapshot_source(source);

    println!("┌─ INITIAL SYNC ──────────────────────────────────────────────────┐");
    let start = Instant::now();
    let synced = wait_until(timeout, || viewer_node_count(&provider) == scene.len());
    println!("│ Nodes sent:         {}", scene.len());
    println!("│ Nodes received:     {}", viewer_node_count(&provider));
    println!("│ Time:               {:.1} ms", start.elapsed().as_secs_f64() * 1000.0);
    println!("│ Result:             {}", if synced { "OK" } else { "TIMEOUT" });
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    // Live edit: move the lamp
    let moved = ParameterValue::Vec3([2.0, 3.0, 1.0]);
    if let Some(lamp) = scene.find_by_name("lamp") {
        lamp.set_parameter("position", moved.clone());
    }
    editor.snapshot_source(source);

    println!("┌─ LIVE EDIT ─────────────────────────────────────────────────────┐");
    let start = Instant::now();
    let edited = wait_until(timeout, || viewer_position(&provider, "lamp") == Some(moved.clone()));
    println!("│ Edited node:        lamp");
    println!("│ Time:               {:.1} ms", start.elapsed().as_secs_f64() * 1000.0);
    println!("│ Result:             {}", if edited { "OK" } else { "TIMEOUT" });
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    print_viewer_scene(&provider);

    let editor_stats = editor.tick_stats();
    let viewer_stats = viewer.tick_stats();
    drop(viewer);
    drop(editor);

    println!();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                    LOOPBACK SHUTDOWN                             ║");
    println!("╠══════════════════════════════════════════════════════════════════╣");
    println!("║ Editor Ticks:       {:>10}                                 ║", editor_stats.total_ticks);
    println!("║ Editor Messages:    {:>10}                                 ║", editor_stats.messages_handled);
    println!("║ Viewer Ticks:       {:>10}                                 ║", viewer_stats.total_ticks);
    println!("║ Viewer Messages:    {:>10}                                 ║", viewer_stats.messages_handled);
    println!("╚══════════════════════════════════════════════════════════════════╝");

    if !(synced && edited) {
        std::process::exit(1);
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn viewer_node_count(provider: &MemorySceneProvider) -> usize {
    provider.scenes().iter().map(|scene| scene.lock().len()).sum()
}

fn viewer_position(provider: &MemorySceneProvider, name: &str) -> Option<ParameterValue> {
    provider
        .scenes()
        .iter()
        .find_map(|scene| scene.lock().find_by_name(name).and_then(|node| node.parameter("position")))
}

fn print_viewer_scene(provider: &MemorySceneProvider) {
    for scene in provider.scenes() {
        let scene = scene.lock();
        let scene_id = scene.scene_id();
        println!("┌─ VIEWER SCENE '{}' ({}) ", scene_id.display_name, scene_id.guid);
        for (id, node) in scene.iter() {
            let name = node.name().unwrap_or_default();
            match node.parameter("position") {
                Some(ParameterValue::Vec3([x, y, z])) => {
                    println!("│ #{id:<3} {name:<10} position = ({x:.1}, {y:.1}, {z:.1})");
                }
                _ => println!("│ #{id:<3} {name:<10}"),
            }
            for (group, targets) in node.reference_ids() {
                if !targets.is_empty() {
                    println!("│        {group} → {targets:?}");
                }
            }
        }
        println!("└──────────────────────────────────────────────────────────────────");
    }
}
