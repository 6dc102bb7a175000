use anyhow::{anyhow, Result};
use clap::{
    app_from_crate, crate_authors, crate_description, crate_name, crate_version, AppSettings, Arg,
    ArgMatches, SubCommand,
};
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use crate::validators::*;
use mapillary_downloader::{DownloadFailurePolicy, Options};

const CONFIG_ARG: &str = "config";
const QUIET_ARG: &str = "quiet";
const VERBOSE_ARG: &str = "verbose";
const OVERWRITE_ARG: &str = "overwrite";
const TILE_CACHE_DIR_ARG: &str = "tile-cache-dir";
const TILE_LIST_FILE_ARG: &str = "tile-list-file";
const TILES_ONLY_ARG: &str = "tiles-only";
const SEQ_DIR_ARG: &str = "seqdir";
const IMAGE_ID_FILE_ARG: &str = "imgid-file";
const FAILED_IMAGE_ID_FILE_ARG: &str = "failed-imgid-file";
const TOKEN_ARG: &str = "token";
const TOKEN_FILE_ARG: &str = "token-file";
const REQUIRED_DISK_SPACE_ARG: &str = "required-disk-space";
const REQUEST_RETRIES_ARG: &str = "num-retries";
const BBOX_NORTH_ARG: &str = "north";
const BBOX_SOUTH_ARG: &str = "south";
const BBOX_WEST_ARG: &str = "west";
const BBOX_EAST_ARG: &str = "east";
const PARALLEL_DOWNLOADS_ARG: &str = "rate";
const TIMEOUT_ARG: &str = "timeout";
const DOWNLOAD_FAILURE_ARG: &str = "on-download-failure";
const DRY_RUN_ARG: &str = "dry-run";

const TILES_DB_CMD: &str = "tiles-db";
const TILES_DB_DIR_ARG: &str = "dir";
const TILES_DB_OUTPUT_ARG: &str = "output";

pub enum Command {
    /// Download the images of the bounding box.
    Download { options: Options, dry_run: bool },
    /// Compact a tile cache directory into a single database file.
    TilesDb { dir: PathBuf, output: PathBuf },
}

pub struct Args {
    pub quiet: bool,
    pub verbose: bool,
    pub command: Command,
}

impl Args {
    pub fn parse() -> Result<Self> {
        let matches = get_matches();
        let sub = matches.subcommand_matches(TILES_DB_CMD);
        // global flags may also be given after the subcommand
        let flag = |name: &str| matches.is_present(name) || sub.map_or(false, |s| s.is_present(name));

        let command = match sub {
            Some(sub) => Command::TilesDb {
                dir: path_of(sub, TILES_DB_DIR_ARG)
                    .ok_or_else(|| anyhow!("missing tile directory"))?,
                output: path_of(sub, TILES_DB_OUTPUT_ARG)
                    .ok_or_else(|| anyhow!("--{} must be set", TILES_DB_OUTPUT_ARG))?,
            },
            None => Command::Download {
                options: options_of(&matches)?,
                dry_run: matches.is_present(DRY_RUN_ARG),
            },
        };

        Ok(Self {
            quiet: flag(QUIET_ARG),
            verbose: flag(VERBOSE_ARG),
            command,
        })
    }
}

fn options_of(matches: &ArgMatches) -> Result<Options> {
    Ok(Options {
        config_file: path_of(matches, CONFIG_ARG),
        tile_cache_dir: path_of(matches, TILE_CACHE_DIR_ARG),
        seq_dir: path_of(matches, SEQ_DIR_ARG),
        west: parse(matches, BBOX_WEST_ARG)?,
        south: parse(matches, BBOX_SOUTH_ARG)?,
        east: parse(matches, BBOX_EAST_ARG)?,
        north: parse(matches, BBOX_NORTH_ARG)?,
        token: matches.value_of(TOKEN_ARG).map(str::to_owned),
        token_file: path_of(matches, TOKEN_FILE_ARG),
        tile_list_file: path_of(matches, TILE_LIST_FILE_ARG),
        image_id_file: path_of(matches, IMAGE_ID_FILE_ARG),
        failed_image_id_file: path_of(matches, FAILED_IMAGE_ID_FILE_ARG),
        required_disk_space_gb: parse_defaulted(matches, REQUIRED_DISK_SPACE_ARG)?,
        retries: parse_defaulted(matches, REQUEST_RETRIES_ARG)?,
        overwrite: matches.is_present(OVERWRITE_ARG),
        tiles_only: matches.is_present(TILES_ONLY_ARG),
        parallel_downloads: parse_defaulted(matches, PARALLEL_DOWNLOADS_ARG)?,
        timeout: Duration::from_secs(parse_defaulted(matches, TIMEOUT_ARG)?),
        on_download_failure: parse_defaulted::<DownloadFailurePolicy>(matches, DOWNLOAD_FAILURE_ARG)?,
    })
}

fn path_of(matches: &ArgMatches, name: &str) -> Option<PathBuf> {
    matches.value_of_os(name).map(PathBuf::from)
}

fn parse<T>(matches: &ArgMatches, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    matches
        .value_of(name)
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| anyhow!("invalid value {:?} for --{}: {}", v, name, e))
        })
        .transpose()
}

fn parse_defaulted<T>(matches: &ArgMatches, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    parse(matches, name)?.ok_or_else(|| anyhow!("--{} must be set", name))
}

fn get_matches() -> ArgMatches<'static> {
    app_from_crate!()
        .setting(AppSettings::GlobalVersion)
        .setting(AppSettings::VersionlessSubcommands)
        .arg(
            Arg::with_name(CONFIG_ARG)
                .help("JSON file with `tile_cache_dir`, `seqdir` and `bounding_box`. Command line options take precedence.")
                .takes_value(true)
                .value_name("FILE")
                .short("c")
                .long("config"),
        )
        .arg(
            Arg::with_name(QUIET_ARG)
                .help("Only log warnings and errors, and hide the progress bar")
                .global(true)
                .conflicts_with(VERBOSE_ARG)
                .short("q")
                .long("quiet"),
        )
        .arg(
            Arg::with_name(VERBOSE_ARG)
                .help("Log every tile and image")
                .global(true)
                .short("v")
                .long("verbose"),
        )
        .arg(
            Arg::with_name(OVERWRITE_ARG)
                .help("Refetch cached tiles and download images again even if they already exist")
                .short("O")
                .long("overwrite"),
        )
        .arg(
            Arg::with_name(TILE_CACHE_DIR_ARG)
                .help("Directory in which to store the tile cache")
                .takes_value(true)
                .value_name("DIR")
                .long("tile-cache-dir"),
        )
        .arg(
            Arg::with_name(TILE_LIST_FILE_ARG)
                .help("Only work on the listed tiles, identified by tile cache file name, one per line")
                .takes_value(true)
                .value_name("FILE")
                .long("tile-list-file"),
        )
        .arg(
            Arg::with_name(TILES_ONLY_ARG)
                .help("Only fill the tile cache, don't download any images")
                .long("tiles-only"),
        )
        .arg(
            Arg::with_name(SEQ_DIR_ARG)
                .help("Directory in which to store the image sequences")
                .takes_value(true)
                .value_name("DIR")
                .long("seqdir"),
        )
        .arg(
            Arg::with_name(IMAGE_ID_FILE_ARG)
                .help("Only download the image ids listed in this file, one per line (or a JSON list of objects with `mapillary_img_id` if the file ends in .json)")
                .takes_value(true)
                .value_name("FILE")
                .long("imgid-file"),
        )
        .arg(
            Arg::with_name(FAILED_IMAGE_ID_FILE_ARG)
                .help("Append the ids of images that could not be downloaded to this file")
                .takes_value(true)
                .value_name("FILE")
                .long("failed-imgid-file"),
        )
        .arg(
            Arg::with_name(TOKEN_ARG)
                .help("Mapillary API access token")
                .takes_value(true)
                .value_name("TOKEN")
                .long("token"),
        )
        .arg(
            Arg::with_name(TOKEN_FILE_ARG)
                .help("Read the access token from the first line of this file instead")
                .takes_value(true)
                .value_name("FILE")
                .default_value("token.txt")
                .long("token-file"),
        )
        .arg(
            Arg::with_name(REQUIRED_DISK_SPACE_ARG)
                .help("Stop once less than this many gigabytes are free on the sequence disk")
                .validator(is_numeric_min(0))
                .takes_value(true)
                .value_name("GB")
                .default_value("100")
                .long("required-disk-space"),
        )
        .arg(
            Arg::with_name(REQUEST_RETRIES_ARG)
                .help("The amount of times to retry a failed request, waiting 1, 2, 4, ... seconds in between")
                .validator(is_numeric_min(0))
                .takes_value(true)
                .value_name("NUM")
                .default_value("8")
                .long("num-retries"),
        )
        .arg(
            Arg::with_name(BBOX_NORTH_ARG)
                .help("Latitude of north bounding box boundary (in degrees)")
                .validator(is_geo_coord)
                .takes_value(true)
                .allow_hyphen_values(true)
                .value_name("LAT")
                .short("n")
                .long("north"),
        )
        .arg(
            Arg::with_name(BBOX_SOUTH_ARG)
                .help("Latitude of south bounding box boundary (in degrees)")
                .validator(is_geo_coord)
                .takes_value(true)
                .allow_hyphen_values(true)
                .value_name("LAT")
                .short("s")
                .long("south"),
        )
        .arg(
            Arg::with_name(BBOX_EAST_ARG)
                .help("Longitude of east bounding box boundary (in degrees)")
                .validator(is_geo_coord)
                .takes_value(true)
                .allow_hyphen_values(true)
                .value_name("LON")
                .short("e")
                .long("east"),
        )
        .arg(
            Arg::with_name(BBOX_WEST_ARG)
                .help("Longitude of west bounding box boundary (in degrees)")
                .validator(is_geo_coord)
                .takes_value(true)
                .allow_hyphen_values(true)
                .value_name("LON")
                .short("w")
                .long("west"),
        )
        .arg(
            Arg::with_name(PARALLEL_DOWNLOADS_ARG)
                .help("The amount of images of a tile downloaded in parallel.")
                .validator(is_numeric_min(1))
                .default_value("1")
                .takes_value(true)
                .short("r")
                .long("rate"),
        )
        .arg(
            Arg::with_name(TIMEOUT_ARG)
                .help("The timeout (in seconds) for a single request. Pass 0 for no timeout.")
                .validator(is_numeric_min(0))
                .default_value("30")
                .takes_value(true)
                .short("t")
                .long("timeout"),
        )
        .arg(
            Arg::with_name(DOWNLOAD_FAILURE_ARG)
                .help("What to do when an image can't be downloaded after all retries: `abort` the run or `record` the image and continue")
                .validator(is_failure_policy)
                .default_value("abort")
                .takes_value(true)
                .long("on-download-failure"),
        )
        .arg(
            Arg::with_name(DRY_RUN_ARG)
                .help("Don't actually fetch anything, just determine how many tiles cover the bounding box.")
                .long("dry-run"),
        )
        .subcommand(
            SubCommand::with_name(TILES_DB_CMD)
                .about("Compact a tile cache directory into a single gzip-compressed JSON image database")
                .arg(
                    Arg::with_name(TILES_DB_DIR_ARG)
                        .help("Directory of cached tiles")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name(TILES_DB_OUTPUT_ARG)
                        .help("File to write the database to")
                        .required(true)
                        .takes_value(true)
                        .value_name("FILE")
                        .short("o")
                        .long("output"),
                ),
        )
        .get_matches()
}
