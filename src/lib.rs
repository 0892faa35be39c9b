//! Library to backup a [WordPress][wp] site to [Google Drive][drive].
//!
//! A backup run dumps the site database, archives the site files, merges
//! both into one archive and uploads it into a Drive folder. The steps are
//! sequenced by the [`orchestrator`].
//!
//! [wp]: https://wordpress.org/
//! [drive]: https://developers.google.com/drive/api/guides/about-sdk

#![forbid(unsafe_code)]

pub mod archive;
pub mod cli;
pub mod drive;
pub mod orchestrator;
pub mod settings;
pub mod util;
pub mod wordpress;
