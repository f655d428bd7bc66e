/// binlog2sql
///
/// Reads the binlog files named in `BINLOG_FILES` and prints (or saves) the
/// SQL they contain, or the SQL that undoes them with `FLASHBACK=1`.
/// Table metadata is looked up on the server given by `DB_HOST`/`DB_PORT`.
use binlog2sql::config::Binlog2SqlConfig;
use binlog2sql::connection::MySqlConnection;
use binlog2sql::output::{ConsoleSink, FileSink, Sink, TablePerFileSink};
use binlog2sql::session::DecoderSession;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Binlog2SqlConfig::from_env()?;
    config.validate()?;
    if config.binlog_files.is_empty() {
        error!("No binlog files given, set BINLOG_FILES");
        return Err("BINLOG_FILES is empty".into());
    }

    info!(
        "Connecting to {}:{}",
        config.connection.hostname, config.connection.port
    );
    let mut catalog = MySqlConnection::connect(config.connection.clone()).await?;
    match catalog.get_binlog_format().await {
        Ok(format) if format != "ROW" => {
            warn!("binlog_format is {}, row events may be missing", format)
        }
        Ok(_) => {}
        Err(e) => warn!("Unable to read binlog_format: {}", e),
    }

    let mut sink: Box<dyn Sink> = if let Some(path) = config.result_path() {
        Box::new(FileSink::create(path).await?)
    } else if config.table_per_file {
        Box::new(TablePerFileSink::new(&config.result_dir, config.date_style()))
    } else {
        Box::new(ConsoleSink)
    };

    let mut session = DecoderSession::new(config.session_options()?, config.sql_options()?)?;
    let stop = session.stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping after the current event");
            stop.stop();
        }
    });

    for (index, path) in config.binlog_files.iter().enumerate() {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let file = tokio::fs::File::open(path).await?;
        let source = tokio::io::BufReader::new(file);
        let outcome = session
            .run_file(&filename, source, config.window(index), &mut catalog, sink.as_mut())
            .await?;
        if !outcome.should_continue() {
            info!("Stopped in {}: {:?}", filename, outcome);
            break;
        }
    }

    session.finish(sink.as_mut()).await?;
    info!("Finished: {}", session.checkpoint().to_json());
    Ok(())
}
