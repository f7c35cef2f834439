//! Processes command implementation.

use std::sync::Arc;

use anyhow::{Result, bail};
use conmem::{Connection, ProcessControl, ProcessInfo, try_get_feature};
use tracing::info;

/// Run the processes command
pub async fn run(
    connection: &Arc<dyn Connection>,
    json: bool,
    attach: Option<u32>,
    attach_game: bool,
) -> Result<()> {
    let Some(control) = try_get_feature::<dyn ProcessControl, _>(connection.as_ref()) else {
        bail!(
            "{} connection has no process control",
            connection.connection_type()
        );
    };

    if attach_game {
        let Some(game) = control.find_game_process().await? else {
            bail!("No game process is running");
        };
        let previous = control.attach_to_process(game.pid).await?;
        info!("Attached to {} ({:#010X}), was {:#010X}", game.name, game.pid, previous);
    } else if let Some(pid) = attach {
        let previous = control.attach_to_process(pid).await?;
        info!("Attached to {:#010X}, was {:#010X}", pid, previous);
    }

    let processes = control.enumerate_processes().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&processes)?);
    } else {
        print!("{}", format_table(&processes));
    }
    Ok(())
}

fn format_table(processes: &[ProcessInfo]) -> String {
    let mut out = format!("{:<10}  {}\n", "PID", "NAME");
    for process in processes {
        out.push_str(&format!("{:08X}    {}\n", process.pid, process.name));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use conmem::FileConnection;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_file_connection_has_no_process_control() {
        let file = NamedTempFile::new().unwrap();
        let conn: Arc<dyn Connection> =
            Arc::new(FileConnection::open(file.path(), 0, true).await.unwrap());

        let err = run(&conn, false, None, false).await.unwrap_err();
        assert!(err.to_string().contains("no process control"));
    }

    #[test]
    fn test_table_layout() {
        let table = format_table(&[ProcessInfo {
            pid: 0x0100_0300,
            name: "EBOOT.BIN".to_string(),
        }]);
        assert_eq!(table, "PID         NAME\n01000300    EBOOT.BIN\n");
    }
}
