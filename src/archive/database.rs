//! Dump of the site database with `mysqldump`.

use std::path::Path;

use crate::settings::Options;
use crate::util::process::{CommandError, CommandRunner, Invocation, Stdout};
use crate::wordpress::DbParams;

/// Builds the `mysqldump` call writing the dump of `db` into `dest`.
///
/// The password is handed over in `MYSQL_PWD`, so it never shows up in the
/// process list.
pub fn dump_invocation(db: &DbParams, options: &Options, dest: &Path) -> Invocation {
    let mut invocation = Invocation::new(&options.mysqldump, options.dump_timeout())
        .arg("--no-tablespaces")
        .arg("--single-transaction")
        .arg(format!("--user={}", db.user))
        .arg(format!("--host={}", db.host.host));
    if let Some(port) = db.host.port {
        invocation = invocation.arg(format!("--port={port}"));
    }
    if let Some(socket) = &db.host.socket {
        invocation = invocation.arg(format!("--socket={socket}"));
    }

    let stdout = if options.compress_dump {
        Stdout::Gzip(dest.to_path_buf())
    } else {
        Stdout::File(dest.to_path_buf())
    };

    invocation
        .arg("--")
        .arg(db.name.as_str())
        .env("MYSQL_PWD", db.password.as_str())
        .stdout(stdout)
}

/// Dumps the database into `dest`. A nonzero exit of `mysqldump` is an error.
pub fn dump_database<R: CommandRunner>(
    runner: &R,
    db: &DbParams,
    options: &Options,
    dest: &Path,
) -> Result<(), CommandError> {
    log::info!(target: "archive::database", "Create database dump of {}", db.name);
    log::trace!(target: "archive::database", "Using dbuser '{}' for backup", db.user);

    runner.run_checked(&dump_invocation(db, options, dest))?;

    log::info!(target: "archive::database", "Finished database dump: {}", dest.display());
    Ok(())
}
