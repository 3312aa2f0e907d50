/// binlog2sql
///
/// binlog을 읽어 정방향/롤백 SQL이나 트랜잭션 통계를 만든다.
use clap::{Parser, ValueEnum};
use rust_binlog2sql::binlog_client::DEFAULT_IDLE_TIMEOUT;
use rust_binlog2sql::config::{
    parse_datetime, FilterMode, DEFAULT_BIG_TRX_ROWS, DEFAULT_INSERT_ROWS, DEFAULT_LONG_TRX_SECS,
    DEFAULT_PRINT_INTERVAL, DEFAULT_THREADS,
};
use rust_binlog2sql::offset::BINLOG_FIRST_EVENT_POS;
use rust_binlog2sql::{
    BinlogFileSource, BinlogPosition, BinlogSqlError, ConnectionConfig, Engine, EngineConfig,
    EventSource, FileCatalog, GenOptions, MySqlCatalog, ReplicationSource, Result, RunSummary,
    StatementKind, TableFilter, WorkType,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// 복제 연결로 binlog 읽기
    Repl,
    /// 로컬 binlog 파일 읽기
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FilterArg {
    Exact,
    Regex,
}

#[derive(Parser, Debug)]
#[command(name = "binlog2sql", version)]
struct Args {
    /// 2sql, rollback, stats
    #[arg(long, short = 'w', default_value = "2sql")]
    work_type: String,

    #[arg(long, value_enum, default_value_t = Mode::Repl)]
    mode: Mode,

    /// mode=file일 때 binlog 파일이 있는 디렉터리
    #[arg(long, default_value = ".")]
    binlog_dir: PathBuf,

    /// 테이블 정의 JSON 파일. 지정하면 서버에서 테이블 구조를 읽지 않는다
    #[arg(long)]
    table_def_file: Option<PathBuf>,

    #[arg(long, short = 'H', default_value = "127.0.0.1")]
    host: String,

    #[arg(long, short = 'P', default_value_t = 3306)]
    port: u16,

    #[arg(long, short = 'u', default_value = "")]
    user: String,

    #[arg(long, short = 'p', default_value = "", env = "MYSQL_PWD")]
    password: String,

    #[arg(long, default_value_t = 1113306)]
    server_id: u32,

    /// 연결 타임아웃 (초)
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    #[arg(long)]
    start_file: String,

    #[arg(long, default_value_t = BINLOG_FIRST_EVENT_POS)]
    start_pos: u64,

    #[arg(long)]
    stop_file: Option<String>,

    #[arg(long, default_value_t = BINLOG_FIRST_EVENT_POS)]
    stop_pos: u64,

    /// "2020-01-01 01:00:00"
    #[arg(long)]
    start_datetime: Option<String>,

    #[arg(long)]
    stop_datetime: Option<String>,

    #[arg(long, value_delimiter = ',')]
    databases: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    tables: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    ignore_databases: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    ignore_tables: Vec<String>,

    /// exact: 대소문자 구분 완전 일치, regex: 소문자로 바꾼 이름에 정규식
    #[arg(long, value_enum, default_value_t = FilterArg::Exact)]
    filter_mode: FilterArg,

    /// insert,update,delete 중 처리할 종류 (기본 전부)
    #[arg(long, value_delimiter = ',')]
    sql: Vec<String>,

    #[arg(long, short = 't', default_value_t = DEFAULT_THREADS)]
    threads: usize,

    #[arg(long, short = 'o', default_value = ".")]
    output_dir: PathBuf,

    #[arg(long)]
    output_to_screen: bool,

    #[arg(long)]
    file_per_table: bool,

    #[arg(long)]
    print_extra_info: bool,

    /// 롤백 파일에서 원래 트랜잭션 경계를 begin/commit으로 유지
    #[arg(long, short = 'k')]
    keep_trx: bool,

    #[arg(long)]
    full_columns: bool,

    #[arg(long, short = 'U')]
    use_unique_key_first: bool,

    #[arg(long)]
    ignore_primary_key_for_insert: bool,

    #[arg(long, default_value_t = DEFAULT_INSERT_ROWS)]
    insert_rows: usize,

    #[arg(long)]
    do_not_add_prefix_db: bool,

    #[arg(long, short = 'i', default_value_t = DEFAULT_PRINT_INTERVAL)]
    print_interval: u32,

    #[arg(long, short = 'b', default_value_t = DEFAULT_BIG_TRX_ROWS)]
    big_trx_row_limit: u64,

    #[arg(long, short = 'l', default_value_t = DEFAULT_LONG_TRX_SECS)]
    long_trx_seconds: u32,
}

impl Args {
    fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            hostname: self.host.clone(),
            port: self.port,
            username: self.user.clone(),
            password: self.password.clone(),
            server_id: self.server_id,
            timeout: Duration::from_secs(self.connect_timeout),
        }
    }

    fn engine_config(&self) -> Result<EngineConfig> {
        if !self.output_dir.is_dir() {
            return Err(BinlogSqlError::InvalidConfig(format!(
                "출력 디렉터리가 없음: {}",
                self.output_dir.display()
            )));
        }

        let filter_mode = match self.filter_mode {
            FilterArg::Exact => FilterMode::Exact,
            FilterArg::Regex => FilterMode::Regex,
        };
        let filter = TableFilter::new(
            filter_mode,
            self.databases.clone(),
            self.tables.clone(),
            self.ignore_databases.clone(),
            self.ignore_tables.clone(),
        )?;

        let statement_kinds = self
            .sql
            .iter()
            .map(|s| s.parse::<StatementKind>())
            .collect::<Result<Vec<_>>>()?;

        let start_datetime = self.start_datetime.as_deref().map(parse_datetime).transpose()?;
        let stop_datetime = self.stop_datetime.as_deref().map(parse_datetime).transpose()?;

        let mut config = EngineConfig {
            work_type: WorkType::parse(&self.work_type)?,
            filter,
            statement_kinds,
            start_position: Some(BinlogPosition::new(self.start_file.clone(), self.start_pos)),
            stop_position: self
                .stop_file
                .as_ref()
                .map(|file| BinlogPosition::new(file.clone(), self.stop_pos)),
            start_datetime,
            stop_datetime,
            output_dir: self.output_dir.clone(),
            output_to_screen: self.output_to_screen,
            file_per_table: self.file_per_table,
            print_extra_info: self.print_extra_info,
            keep_trx: self.keep_trx,
            threads: self.threads,
            gen: GenOptions {
                rollback: false,
                prefer_unique_key: self.use_unique_key_first,
                full_image: self.full_columns,
                ignore_primary_key_for_insert: self.ignore_primary_key_for_insert,
                rows_per_statement: self.insert_rows,
                prefix_database: !self.do_not_add_prefix_db,
            },
            print_interval: self.print_interval,
            big_trx_rows: self.big_trx_row_limit,
            long_trx_secs: self.long_trx_seconds,
        };
        config.validate()?;
        Ok(config)
    }
}

/// 카탈로그를 골라 파이프라인을 실행한다
async fn run<S: EventSource>(args: &Args, config: EngineConfig, source: S) -> Result<RunSummary> {
    let engine = Engine::new(config);
    match &args.table_def_file {
        Some(path) => {
            let catalog = FileCatalog::load(path)?;
            engine.run(source, catalog, &args.start_file).await
        }
        None => {
            let catalog = MySqlCatalog::new(&args.connection());
            catalog.check_server().await?;
            engine.run(source, catalog, &args.start_file).await
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.engine_config()?;
    let start_file = args.start_file.clone();

    let summary = match args.mode {
        Mode::File => {
            let source =
                BinlogFileSource::new(&args.binlog_dir, &start_file, args.start_pos, config.has_stop_bound());
            run(&args, config, source).await?
        }
        Mode::Repl => {
            // 화면 출력일 때는 새 이벤트를 계속 기다린다
            let idle_timeout = if config.output_to_screen {
                None
            } else {
                Some(DEFAULT_IDLE_TIMEOUT)
            };
            let source = ReplicationSource::new(args.connection(), start_file.clone(), args.start_pos)
                .with_idle_timeout(idle_timeout);
            run(&args, config, source).await?
        }
    };

    info!(
        "Done: {} row events, last binlog {}, {} rollback files",
        summary.forwarded, summary.last_binlog, summary.rollback_files
    );
    Ok(())
}
