use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const ID_LENGTH: usize = 21;

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// Generate an opaque identifier for players, matches and game epochs
pub fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}

// Generate a display name such as "Salty Kraken"
pub fn generate_username() -> String {
    const ADJECTIVES: [&str; 8] = [
        "Salty", "Brave", "Sneaky", "Rusty", "Stormy", "Jolly", "Crafty", "Silent",
    ];
    const NOUNS: [&str; 8] = [
        "Kraken", "Admiral", "Barnacle", "Corsair", "Gull", "Harpoon", "Mariner", "Narwhal",
    ];

    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Salty");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("Kraken");

    format!("{} {}", adjective, noun)
}
