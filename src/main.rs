//! hoard CLI - content-addressable storage command line interface

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hoard::config::Config;
use hoard::schema::{self, HttpClientConfig, LocalDirConfig, Object};
use hoard::storage::server::Server;
use hoard::store::{OpenOptions, Store, StoreConfig, DEFAULT_DIR, DEFAULT_PIN};
use hoard::{hash_file, is_ref_string, CancelToken, Hasher, Ref};

#[derive(Parser)]
#[command(name = "hoard")]
#[command(about = "content-addressable storage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a store in the current directory
    Init {
        #[command(subcommand)]
        remote: Option<InitCmd>,
    },

    /// commands related to binary data in the store
    #[command(alias = "blobs", alias = "b")]
    Blob {
        #[command(subcommand)]
        cmd: BlobCmd,
    },

    /// commands related to named pins
    Pin {
        #[command(subcommand)]
        cmd: PinCmd,
    },

    /// store URLs or files in the store
    Fetch {
        addrs: Vec<String>,
    },

    /// index URLs or files by hash without storing their bytes
    Index {
        addrs: Vec<String>,
    },

    /// import local files while reusing underlying storage blocks
    Import {
        paths: Vec<PathBuf>,
    },

    /// store URLs or files, printing sizes
    Pull {
        addrs: Vec<String>,
    },

    /// restore a pin or ref to a path
    #[command(alias = "co", alias = "restore")]
    Checkout {
        /// a pin name or ref, when two arguments are given
        #[arg(required = true, num_args = 1..=2)]
        args: Vec<String>,
    },

    /// hash files, caching refs in extended attributes
    #[command(alias = "sum")]
    Hash {
        /// ignore the refs cache
        #[arg(short, long)]
        force: bool,
        paths: Vec<PathBuf>,
    },

    /// commands related to schema blobs
    #[command(alias = "sch", alias = "s")]
    Schema {
        #[command(subcommand)]
        cmd: SchemaCmd,
    },

    /// process blobs via an external pipeline command
    #[command(alias = "pipe")]
    Pipeline {
        command: String,
        #[arg(required = true)]
        refs: Vec<String>,
    },

    /// sync one or more web blobs with their origin
    Sync {
        names: Vec<String>,
    },

    /// serve the store over HTTP
    Serve {
        /// host to listen on
        #[arg(long, default_value = "localhost:9080")]
        host: String,
    },

    /// commands related to captured HTTP exchanges
    Http {
        #[command(subcommand)]
        cmd: HttpCmd,
    },
}

#[derive(Subcommand)]
enum InitCmd {
    /// init a client for a remote store
    #[command(alias = "remote", alias = "client")]
    Http { url: String },
}

#[derive(Subcommand)]
enum BlobCmd {
    /// dump blob contents to stdout
    #[command(alias = "get", alias = "dump")]
    Cat {
        #[arg(required = true)]
        refs: Vec<String>,
    },
    /// list stored blobs
    #[command(alias = "ls", alias = "l")]
    List,
}

#[derive(Subcommand)]
enum PinCmd {
    /// set a named pin pointing to a ref
    Set {
        /// `<ref>` or `<name> <ref>`
        #[arg(required = true, num_args = 1..=2)]
        args: Vec<String>,
    },
    /// print the pinned ref
    Get {
        name: Option<String>,
    },
    /// list pins, optionally filtered by a glob pattern
    #[command(alias = "ls", alias = "l")]
    List {
        pattern: Option<String>,
    },
    /// delete a pin
    Del {
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum SchemaCmd {
    /// list schema blobs
    #[command(alias = "ls", alias = "l")]
    List {
        /// types to include
        #[arg(short, long)]
        r#type: Vec<String>,
        /// only print refs
        #[arg(short, long)]
        short: bool,
    },
    /// list the data blobs inside a schema blob
    DataIn {
        r#ref: String,
        /// count blobs and bytes instead of listing them
        #[arg(short, long)]
        count: bool,
        /// limit the number of blobs
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// rebuild the schema index
    Reindex {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum HttpCmd {
    /// list captured request blobs
    Req {
        /// filter by URL prefix
        #[arg(short, long)]
        url: Option<String>,
    },
    /// list recorded sessions
    Sess {
        /// filter by request ref
        #[arg(long)]
        req: Option<String>,
        /// filter by response ref
        #[arg(long)]
        resp: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// open `./.cas`, falling back to the store in the home directory
fn open_store(create: bool) -> hoard::Result<Store> {
    let dir = PathBuf::from(DEFAULT_DIR);
    match Store::open(&OpenOptions {
        dir: dir.clone(),
        create,
    }) {
        Ok(s) => Ok(s),
        Err(err) => {
            if !create {
                if let Some(home) = dirs_next::home_dir() {
                    let global = home.join(DEFAULT_DIR);
                    if let Ok(s) = Store::open(&OpenOptions {
                        dir: global.clone(),
                        create: false,
                    }) {
                        eprintln!("using global store: {}", global.display());
                        return Ok(s);
                    }
                }
            }
            Err(err)
        }
    }
}

fn run(cli: Cli) -> hoard::Result<()> {
    let cancel = CancelToken::new();
    match cli.command {
        Commands::Init { remote } => {
            let storage = match remote {
                None => Object::LocalDirConfig(LocalDirConfig {
                    dir: ".".to_string(),
                }),
                Some(InitCmd::Http { url }) => {
                    url::Url::parse(&url).map_err(|e| hoard::Error::Config(e.to_string()))?;
                    Object::HttpClientConfig(HttpClientConfig { url })
                }
            };
            Store::init_at(DEFAULT_DIR.as_ref(), &Config { storage })?;
            println!("initialized store at {}", DEFAULT_DIR);
        }

        Commands::Blob { cmd } => match cmd {
            BlobCmd::Cat { refs } => {
                let s = open_store(false)?;
                let stdout = io::stdout();
                let mut w = stdout.lock();
                for arg in refs {
                    let r = s.get_pin_or_ref(&cancel, &arg)?;
                    let (mut rc, _) = s.fetch_blob(&cancel, &r)?;
                    let mut buf = [0u8; 64 * 1024];
                    loop {
                        let n = rc
                            .read(&mut buf)
                            .map_err(|e| hoard::Error::from_io(e, "<blob>"))?;
                        if n == 0 {
                            break;
                        }
                        w.write_all(&buf[..n])
                            .map_err(|e| hoard::Error::from_io(e, "<stdout>"))?;
                    }
                }
            }
            BlobCmd::List => {
                let s = open_store(false)?;
                for item in s.iterate_blobs(&cancel) {
                    let sr = item?;
                    println!("{} {}", sr.r#ref, sr.size);
                }
            }
        },

        Commands::Pin { cmd } => match cmd {
            PinCmd::Set { args } => {
                let s = open_store(true)?;
                let (name, sref) = match args.len() {
                    1 => (DEFAULT_PIN.to_string(), args[0].clone()),
                    _ => (args[0].clone(), args[1].clone()),
                };
                let r = Ref::parse(&sref)?;
                s.set_pin(&cancel, &name, &r)?;
                println!("{} = {}", name, r);
            }
            PinCmd::Get { name } => {
                let s = open_store(false)?;
                let r = s.get_pin(&cancel, name.as_deref().unwrap_or(DEFAULT_PIN))?;
                println!("{}", r);
            }
            PinCmd::List { pattern } => {
                let s = open_store(false)?;
                let glob = match &pattern {
                    Some(p) => Some(
                        glob::Pattern::new(p)
                            .map_err(|e| hoard::Error::Config(e.to_string()))?,
                    ),
                    None => None,
                };
                for item in s.iterate_pins(&cancel) {
                    let pin = item?;
                    if let Some(g) = &glob {
                        if !g.matches(&pin.name) {
                            continue;
                        }
                    }
                    println!("{} = {}", pin.name, pin.r#ref);
                }
            }
            PinCmd::Del { name } => {
                let s = open_store(false)?;
                s.delete_pin(&cancel, name.as_deref().unwrap_or(DEFAULT_PIN))?;
            }
        },

        Commands::Fetch { addrs } => {
            let s = open_store(true)?;
            store_addrs(&s, &cancel, &addrs, false, false)?;
        }

        Commands::Index { addrs } => {
            let s = open_store(true)?;
            store_addrs(&s, &cancel, &addrs, true, false)?;
        }

        Commands::Import { paths } => {
            let s = open_store(true)?;
            let mut last = Ok(());
            for path in paths {
                match s.import_file_path(&cancel, &path) {
                    Ok(sr) => println!("{} {}", sr.r#ref, path.display()),
                    Err(e) => {
                        println!("{} {}", path.display(), e);
                        last = Err(e);
                    }
                }
            }
            last?;
        }

        Commands::Pull { addrs } => {
            let s = open_store(true)?;
            store_addrs(&s, &cancel, &addrs, false, true)?;
        }

        Commands::Checkout { args } => {
            let s = open_store(false)?;
            let (name, path) = match args.len() {
                1 => (DEFAULT_PIN.to_string(), PathBuf::from(&args[0])),
                _ => (args[0].clone(), PathBuf::from(&args[1])),
            };
            let r = s.get_pin_or_ref(&cancel, &name)?;
            s.checkout(&cancel, &r, &path)?;
            println!("{} -> {}", r, path.display());
        }

        Commands::Hash { force, paths } => {
            if paths.is_empty() {
                let mut h = Hasher::new();
                let mut buf = [0u8; 64 * 1024];
                let stdin = io::stdin();
                let mut rc = stdin.lock();
                loop {
                    let n = rc
                        .read(&mut buf)
                        .map_err(|e| hoard::Error::from_io(e, "<stdin>"))?;
                    if n == 0 {
                        break;
                    }
                    h.update(&buf[..n]);
                }
                println!("{} -", h.finalize());
                return Ok(());
            }
            for path in paths {
                for entry in walkdir::WalkDir::new(&path) {
                    let entry = entry
                        .map_err(|e| hoard::Error::Config(e.to_string()))?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if !force {
                        if let Ok(sr) = hoard::files::stat_file(entry.path()) {
                            if !sr.r#ref.is_zero() {
                                println!("{} {} (cached)", sr.r#ref, entry.path().display());
                                continue;
                            }
                        }
                    }
                    let sr = hash_file(&cancel, entry.path(), force)?;
                    println!("{} {}", sr.r#ref, entry.path().display());
                }
            }
        }

        Commands::Schema { cmd } => match cmd {
            SchemaCmd::List { r#type, short } => {
                let s = open_store(false)?;
                for item in s.iterate_schema(&cancel, &r#type) {
                    let sr = item?;
                    if short {
                        println!("{}", sr.r#ref);
                    } else {
                        println!("{} {} {}", sr.r#ref, sr.size, sr.r#type);
                    }
                }
            }
            SchemaCmd::DataIn {
                r#ref,
                count,
                limit,
            } => {
                let s = open_store(false)?;
                let root = Ref::parse(&r#ref)?;
                let mut cnt = 0usize;
                let mut size = 0u64;
                for item in s.iterate_data_blobs_in(&cancel, root) {
                    if let Some(limit) = limit {
                        if cnt >= limit {
                            break;
                        }
                    }
                    let sr = item?;
                    cnt += 1;
                    if count {
                        size += sr.size;
                    } else {
                        println!("{} {}", sr.r#ref, sr.size);
                    }
                }
                if count {
                    println!("blobs: {} size: {}", cnt, size);
                }
            }
            SchemaCmd::Reindex { force } => {
                let s = open_store(false)?;
                s.reindex_schema(&cancel, force)?;
            }
        },

        Commands::Pipeline { command, refs } => {
            let s = open_store(false)?;
            let mut parsed = Vec::with_capacity(refs.len());
            for sref in &refs {
                parsed.push(Ref::parse(sref)?);
            }
            for res in s.run_pipeline(&cancel, &command, &parsed)? {
                if res.cached {
                    println!("{} -> {} (cached)", res.src, res.dst);
                } else {
                    println!("{} -> {}", res.src, res.dst);
                }
            }
        }

        Commands::Sync { names } => {
            let s = open_store(false)?;
            let names = if names.is_empty() {
                vec![DEFAULT_PIN.to_string()]
            } else {
                names
            };
            let mut last = Ok(());
            for name in names {
                let res = s.get_pin_or_ref(&cancel, &name).and_then(|r| {
                    let nref = s.sync_blob(&cancel, &r)?;
                    if nref != r && !is_ref_string(&name) {
                        s.set_pin(&cancel, &name, &nref)?;
                    }
                    Ok((r, nref))
                });
                match res {
                    Ok((r, nref)) if r == nref => println!("{} -> {} (up-to-date)", name, r),
                    Ok((_, nref)) => println!("{} -> {}", name, nref),
                    Err(e) => {
                        println!("{} {}", name, e);
                        last = Err(e);
                    }
                }
            }
            last?;
        }

        Commands::Serve { host } => {
            let s = open_store(false)?;
            let server = Server::bind(&host)?;
            println!("listening on {}", server.local_addr()?);
            let backend: Arc<dyn hoard::storage::Storage> = s.backend().clone();
            server.serve(backend)?;
        }

        Commands::Http { cmd } => match cmd {
            HttpCmd::Req { url } => {
                let s = open_store(false)?;
                for item in
                    s.iterate_schema(&cancel, &[schema::TYPE_HTTP_REQUEST.to_string()])
                {
                    let sr = item?;
                    let r = match s.decode_schema(&cancel, &sr.r#ref)? {
                        Object::HttpRequest(r) => r,
                        _ => continue,
                    };
                    if let Some(prefix) = &url {
                        if !r.url.as_str().starts_with(prefix) {
                            continue;
                        }
                    }
                    println!("{} {} {}", sr.r#ref, r.method, r.url);
                }
            }
            HttpCmd::Sess { req, resp } => {
                let s = open_store(false)?;
                let req = req.map(|v| Ref::parse(&v)).transpose()?;
                let resp = resp.map(|v| Ref::parse(&v)).transpose()?;
                for item in
                    s.iterate_schema(&cancel, &[schema::TYPE_HTTP_SESSION.to_string()])
                {
                    let sr = item?;
                    let sess = match s.decode_schema(&cancel, &sr.r#ref)? {
                        Object::HttpSession(sess) => sess,
                        _ => continue,
                    };
                    if let Some(r) = req {
                        if sess.request != r {
                            continue;
                        }
                    }
                    if let Some(r) = resp {
                        if sess.response != r {
                            continue;
                        }
                    }
                    println!("{} {} {}", sr.r#ref, sess.request, sess.response);
                }
            }
        },
    }
    Ok(())
}

fn store_addrs(
    s: &Store,
    cancel: &CancelToken,
    addrs: &[String],
    index_only: bool,
    with_size: bool,
) -> hoard::Result<()> {
    let conf = StoreConfig {
        index_only,
        ..Default::default()
    };
    let mut last = Ok(());
    for addr in addrs {
        match s.store_addr(cancel, addr, &conf) {
            Ok(sr) if with_size => println!("{} {} {}", sr.r#ref, sr.size, addr),
            Ok(sr) => println!("{} {}", sr.r#ref, addr),
            Err(e) => {
                println!("{} {}", addr, e);
                last = Err(e);
            }
        }
    }
    last
}
