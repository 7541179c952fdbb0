//! Lock administration: `gitplan locks`.

use anyhow::Result;
use gitplan::config::GitplanToml;
use gitplan::locking::{Client, Locker, parse_key};

use super::super::LocksCommands;

pub async fn cmd_locks(config: &GitplanToml, command: LocksCommands) -> Result<()> {
    let backend = gitplan::server::open_stores(config)?.locks;
    let locker = Client::new(backend);

    match command {
        LocksCommands::List => {
            let locks = locker.list().await?;
            if locks.is_empty() {
                println!("No locks held.");
                return Ok(());
            }
            println!("{:<50} {:>6}  {:<16} LOCKED AT", "KEY", "PULL", "USER");
            for (key, lock) in &locks {
                println!(
                    "{:<50} {:>6}  {:<16} {}",
                    key,
                    format!("#{}", lock.pull.num),
                    lock.user.username,
                    lock.time.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        LocksCommands::Unlock { key } => {
            parse_key(&key)?;
            match locker.unlock(&key).await? {
                Some(lock) => println!("Released {} (held by pull #{}).", key, lock.pull.num),
                None => println!("No lock at {}.", key),
            }
        }
    }
    Ok(())
}
