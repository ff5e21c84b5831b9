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

//! The yam build service daemon.

use std::path::PathBuf;
use std::process::exit;

use structopt::StructOpt;

use yam::{BuildService, Error};

#[derive(StructOpt)]
#[structopt(name = "yamd", about = "The yam build service.")]
struct Opts {
    /// Home repository directory. Defaults to the `.yam` root above the
    /// current directory, or the current directory itself.
    #[structopt(long = "dir", parse(from_os_str))]
    dir: Option<PathBuf>,
}

fn run(opts: &Opts) -> Result<(), Error> {
    let start = match &opts.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let home = yam::repo::find_dot_yam(&start).unwrap_or(start);

    let mut service = BuildService::new(&home)?;
    service.run()
}

fn main() {
    pretty_env_logger::init();

    let opts = Opts::from_args();

    if let Err(err) = run(&opts) {
        eprintln!("yamd: {}", err);
        for cause in err.iter_causes() {
            eprintln!("  caused by: {}", cause);
        }
        exit(1);
    }
}
