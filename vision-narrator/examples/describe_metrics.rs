// Example: narrate a tree-cover measurement with the language model, falling back to rules
use vision_narrator::{rule_based_narrative, ImageAttachment, NarrativeClient, TreeMetrics};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // Usage: describe_metrics <cover_percent> <tree_count> [IMAGE_PATH]
    let args: Vec<String> = std::env::args().collect();
    let tree_cover_percent: f64 = args.get(1).map(|s| s.parse()).transpose()?.unwrap_or(18.5);
    let tree_count: u64 = args.get(2).map(|s| s.parse()).transpose()?.unwrap_or(6);
    let metrics = TreeMetrics {
        tree_cover_percent,
        tree_count,
    };

    println!("Tree cover: {:.1}%  Trees: {}\n", tree_cover_percent, tree_count);

    println!("Rule-based narrative");
    println!("{}", "=".repeat(70));
    println!("{}\n", rule_based_narrative(&metrics).text);

    let client = match NarrativeClient::from_env() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Skipping language model narrative: {}", e);
            return Ok(());
        }
    };

    let image_bytes = match args.get(3) {
        Some(path) => Some(std::fs::read(path)?),
        None => None,
    };
    let image = image_bytes.as_deref().map(|bytes| ImageAttachment {
        bytes,
        mime: if path_is_jpeg(args.get(3)) { "image/jpeg" } else { "image/png" },
    });

    println!("Language model narrative ({})", client.model());
    println!("{}", "=".repeat(70));
    match client.describe(&metrics, image).await {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Narrative request failed: {}", e),
    }

    Ok(())
}

fn path_is_jpeg(path: Option<&String>) -> bool {
    path.map(|p| {
        let p = p.to_ascii_lowercase();
        p.ends_with(".jpg") || p.ends_with(".jpeg")
    })
    .unwrap_or(false)
}
