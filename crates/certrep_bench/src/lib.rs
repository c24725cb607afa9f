//! Benchmark utilities.

use certrep_core::{ClientState, Key, KeyType, MemoryStorage, ReplResult};
use rand::Rng;

/// Generate random payload of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Exclusive key on one row.
pub fn row_key(row: u64) -> Key {
    Key::new(KeyType::Exclusive)
        .with_part("bench")
        .with_part(row.to_be_bytes().to_vec())
}

/// Runs one single-statement replicated transaction to completion.
pub fn replicated_commit(
    client: &ClientState,
    storage: &MemoryStorage,
    keys: &[Key],
    data: &[u8],
) -> ReplResult<()> {
    client.before_command()?;
    client.before_statement()?;
    client.begin()?;
    for key in keys {
        client.append_key(key)?;
    }
    storage.stage(data);
    client.commit()?;
    client.after_statement()?;
    client.after_command_before_result()?;
    client.after_command_after_result()
}
