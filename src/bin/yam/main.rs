// Copyright (c) 2020 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The yam client front-end.
//!
//! Exit code 0 means the build succeeded; 1 means it failed or the service
//! was unreachable. Without `--no-server` the client connects to (or
//! spawns) the background service; with it the build runs in-process.

use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use structopt::StructOpt;

use yam::server::ServicePortRegistry;
use yam::{
    BuildClient, BuildRequest, Builder, Error, RequestKind, ResultExt,
};

#[derive(StructOpt)]
#[structopt(name = "yam", about = "Yet another make.")]
struct Opts {
    /// Directory to build from. Defaults to the current directory.
    #[structopt(long = "dir", parse(from_os_str))]
    dir: Option<PathBuf>,

    /// Initialize a new yam repository instead of building.
    #[structopt(long = "init")]
    init: bool,

    /// Delete generated outputs instead of building.
    #[structopt(long = "clean")]
    clean: bool,

    /// Ask the background service to terminate.
    #[structopt(long = "shutdown")]
    shutdown: bool,

    /// Run the build in-process instead of through the service.
    #[structopt(long = "no-server")]
    no_server: bool,
}

fn request_kind(opts: &Opts) -> RequestKind {
    if opts.init {
        RequestKind::Init
    } else if opts.clean {
        RequestKind::Clean
    } else {
        RequestKind::Build
    }
}

fn run(opts: &Opts) -> Result<bool, Error> {
    let directory = match &opts.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let home =
        yam::repo::find_dot_yam(&directory).unwrap_or_else(|| directory.clone());

    if opts.shutdown {
        let mut client = BuildClient::connect(&home)?;
        client.shutdown()?;
        return Ok(true);
    }

    let request = BuildRequest::new(request_kind(opts), directory);

    if opts.no_server {
        let mut builder = Builder::new();
        let result = builder.handle(request);
        return Ok(result.succeeded());
    }

    let mut client = connect_or_spawn(&home)?;
    let result = client.build(request, |record| {
        println!("{}", record);
    })?;

    Ok(result.succeeded())
}

/// Connects to the registered service, spawning `yamd` first when no live
/// service is found.
fn connect_or_spawn(home: &std::path::Path) -> Result<BuildClient, Error> {
    let live = ServicePortRegistry::read(home)
        .map_or(false, |registry| registry.service_running());

    if !live {
        let yamd = std::env::current_exe()
            .ok()
            .and_then(|exe| {
                exe.parent().map(|dir| dir.join("yamd"))
            })
            .filter(|path| path.is_file())
            .unwrap_or_else(|| PathBuf::from("yamd"));

        std::process::Command::new(&yamd)
            .arg("--dir")
            .arg(home)
            .spawn()
            .with_context(|_| format!("could not spawn {:?}", yamd))?;

        // Wait for the service to register its port.
        for _ in 0..100 {
            if ServicePortRegistry::read(home)
                .map_or(false, |r| r.service_running())
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    BuildClient::connect(home)
}

fn main() {
    pretty_env_logger::init();

    let opts = Opts::from_args();

    match run(&opts) {
        Ok(true) => exit(0),
        Ok(false) => exit(1),
        Err(err) => {
            eprintln!("yam: {}", err);
            for cause in err.iter_causes() {
                eprintln!("  caused by: {}", cause);
            }
            exit(1);
        }
    }
}
