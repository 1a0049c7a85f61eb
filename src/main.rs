use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use env_logger::Env;
use log::{debug, error, info, warn, LevelFilter};
use parking_lot::Mutex;
use time::format_description::well_known::Rfc3339;

use onionbox::cli::{Cli, Commands, Config};
use onionbox::{crypto, ingest, memory, pack};
use onionbox::{Error, FileUpload, Reaper, SecureStore, UploadOptions};

fn main() {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if cli.debug {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    if let Err(e) = memory::disable_core_dumps() {
        warn!("Unable to disable core dumps: {}", e);
    }

    let config = Config::load(cli.config.as_deref())?;
    debug!("Config: {:?}", config);

    match cli.command {
        Commands::Share {
            files,
            password,
            expire,
            limit,
        } => {
            let options = UploadOptions {
                password,
                expiration: expire,
                download_limit: limit,
                ..config.upload_options()
            };
            share(&config, &files, &options)
        }
        Commands::Unpack {
            archive,
            dir,
            password,
        } => unpack(&archive, &dir, password.as_deref()),
    }
}

fn share(config: &Config, paths: &[PathBuf], options: &UploadOptions) -> Result<(), Error> {
    let store = Arc::new(SecureStore::new()?);
    let reaper: Arc<Mutex<Option<Reaper>>> = Arc::new(Mutex::new(None));

    {
        let store = store.clone();
        let reaper = reaper.clone();
        ctrlc::set_handler(move || {
            info!("Interrupted, shutting down");
            if let Err(e) = shutdown(&store, &reaper) {
                error!("Shutdown cleanup failed: {}", e);
            }
            std::process::exit(130);
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    }

    let files = paths
        .iter()
        .map(|p| FileUpload::open(p))
        .collect::<Result<Vec<_>, _>>()?;

    let buffer = ingest(&store, files, options)?;
    println!("{}", buffer.name());
    if let Some(expires_at) = buffer.expires_at() {
        let expires_at = expires_at
            .format(&Rfc3339)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        println!("expires at {}", expires_at);
    }
    drop(buffer);

    *reaper.lock() = Some(Reaper::spawn(store.clone(), config.reap_interval())?);
    let served = serve(&store, std::io::stdin().lock(), std::io::stdout());

    shutdown(&store, &reaper)?;
    served
}

// Stops the reaper first so nothing races the final teardown
fn shutdown(store: &SecureStore, reaper: &Mutex<Option<Reaper>>) -> Result<(), Error> {
    let running = reaper.lock().take();
    if let Some(running) = running {
        running.shutdown();
    }
    store.destroy_all()
}

// Line protocol standing in for the download routes
fn serve<R: BufRead, W: Write>(store: &SecureStore, input: R, mut output: W) -> Result<(), Error> {
    for line in input.lines() {
        let line = line?;
        let words: Vec<&str> = line.split_whitespace().collect();

        match words.as_slice() {
            [] => continue,
            ["quit"] => break,
            ["exists", handle] => writeln!(output, "{}", store.exists(handle))?,
            ["get", handle, out] => get(store, handle, Path::new(out), None, &mut output)?,
            ["get", handle, out, password] => {
                get(store, handle, Path::new(out), Some(*password), &mut output)?
            }
            _ => writeln!(
                output,
                "usage: exists <handle> | get <handle> <file> [password] | quit"
            )?,
        }
        output.flush()?;
    }
    Ok(())
}

fn get<W: Write>(
    store: &SecureStore,
    handle: &str,
    out: &Path,
    password: Option<&str>,
    output: &mut W,
) -> Result<(), Error> {
    match store.download(handle, password) {
        Ok(download) => {
            std::fs::write(out, &download[..])?;
            writeln!(
                output,
                "wrote {} ({} bytes, {}) to {}",
                download.file_name(),
                download.len(),
                download.content_type(),
                out.display()
            )?;
        }
        // Same answer for every refusal
        Err(e) if e.is_not_found() => writeln!(output, "not found")?,
        Err(Error::StoreError(_)) => writeln!(output, "not found")?,
        Err(Error::IntegrityError) => writeln!(output, "integrity check failed")?,
        Err(e) => return Err(e),
    }
    Ok(())
}

fn unpack(archive: &Path, dir: &Path, password: Option<&str>) -> Result<(), Error> {
    crypto::init()?;

    let data = std::fs::read(archive)?;
    let entries = match password {
        Some(password) => pack::unpack(&crypto::decrypt(&data, password)?[..])?,
        None => pack::unpack(&data[..])?,
    };

    std::fs::create_dir_all(dir)?;
    for entry in entries {
        // Never let an entry name escape `dir`
        let name = Path::new(&entry.name)
            .file_name()
            .ok_or_else(|| Error::ParseError {
                what: "entry name",
                value: entry.name.clone(),
            })?;
        let path = dir.join(name);

        std::fs::write(&path, &entry.data)?;
        info!("Extracted {} ({} bytes)", path.display(), entry.data.len());
    }
    Ok(())
}



#[cfg(test)]
mod test_unpack {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn extracts_and_flattens_names() {
        let dir = tempfile::tempdir().unwrap();
        crypto::init().unwrap();

        // Another tool may well write parent components, build one by hand
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        let name = b"../escape.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &b"nope"[..]).unwrap();
        let tar = builder.into_inner().unwrap();

        let mut packager = pack::Packager::new(Vec::new(), 64, 3).unwrap();
        packager.append("a.txt", 5, &mut Cursor::new(b"Hello")).unwrap();
        let package = packager.finish().unwrap();

        let foreign = dir.path().join("foreign.tar.zst");
        std::fs::write(&foreign, zstd::encode_all(&tar[..], 3).unwrap()).unwrap();
        let archive = dir.path().join("pkg.tar.zst");
        std::fs::write(&archive, crypto::encrypt(&package, "pw").unwrap()).unwrap();

        let target = dir.path().join("out");
        unpack(&archive, &target, Some("pw")).unwrap();
        unpack(&foreign, &target, None).unwrap();

        assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), b"Hello");
        assert_eq!(std::fs::read(target.join("escape.txt")).unwrap(), b"nope");
        assert!(!dir.path().join("escape.txt").exists());

        assert!(unpack(&archive, &target, Some("wrong")).is_err());
    }
}
