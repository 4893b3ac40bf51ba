use gplift_upgrade::version::{multiline, oneline};

use crate::VersionFormat;

pub fn version(format: VersionFormat) {
    match format {
        VersionFormat::Multiline => print!("{}", multiline()),
        VersionFormat::Oneline => println!("{}", oneline()),
    }
}
