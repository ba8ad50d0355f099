// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use std::default::Default;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

fn read_json<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut f = fs::OpenOptions::new().read(true).open(path)?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;

    // Allow comment lines so that hand-edited files can be annotated.
    let mut body = String::new();
    for line in buf.lines() {
        let trimmed = line.trim();
        if !(trimmed.starts_with("//") || trimmed.starts_with("#")) {
            body = body + line;
        }
        body = body + "\n";
    }
    Ok(body)
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let body = read_json(path)?;
        Ok(serde_json::from_str::<Self>(&body)?)
    }
}

pub trait JsonSave
where
    Self: Serialize,
{
    fn maybe_create_dfl<P: AsRef<Path>>(path_in: P) -> Result<bool>
    where
        Self: Default,
    {
        let path = path_in.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(&parent)?;
            }
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut f) => {
                let data: Self = Default::default();
                f.write_all(data.as_json()?.as_ref())?;
                Ok(true)
            }
            Err(e) => match e.kind() {
                io::ErrorKind::AlreadyExists => Ok(false),
                _ => Err(e.into()),
            },
        }
    }

    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with("\n") {
            serialized += "\n";
        }
        Ok(serialized)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        f.write_all(self.as_json()?.as_ref())?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct JsonConfigFile<T: JsonLoad + JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave + Default> JsonConfigFile<T> {
    pub fn load<P: AsRef<Path>>(path_in: P) -> Result<Self> {
        let path = AsRef::<Path>::as_ref(&path_in);
        let data = T::load(&path).with_context(|| format!("loading {:?}", path))?;

        Ok(Self {
            path: Some(PathBuf::from(path)),
            data,
        })
    }

    pub fn load_or_create<P: AsRef<Path>>(path_opt: Option<P>) -> Result<Self> {
        match path_opt {
            Some(path_in) => {
                let path = AsRef::<Path>::as_ref(&path_in);

                if T::maybe_create_dfl(&path)? {
                    info!("cfg: Created {:?}", &path);
                }

                Self::load(path)
            }
            None => Ok(Self {
                path: None,
                data: Default::default(),
            }),
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(path) = self.path.as_deref() {
            self.data.save(&path)
        } else {
            Ok(())
        }
    }
}

pub trait JsonArgs
where
    Self: JsonLoad + JsonSave + Default,
{
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool>;
}

pub trait JsonArgsHelper
where
    Self: JsonArgs,
{
    fn init_args_and_logging_nosave() -> Result<(JsonConfigFile<Self>, bool)>;
    fn save_args(args_file: &JsonConfigFile<Self>) -> Result<()>;
    fn init_args_and_logging() -> Result<JsonConfigFile<Self>>;
}

impl<T> JsonArgsHelper for T
where
    T: JsonArgs,
{
    fn init_args_and_logging_nosave() -> Result<(JsonConfigFile<T>, bool)> {
        let matches = T::match_cmdline();
        super::init_logging(T::verbosity(&matches));

        let mut args_file = JsonConfigFile::<T>::load_or_create(matches.value_of("args").as_ref())?;
        let updated = args_file.data.process_cmdline(&matches)?;

        Ok((args_file, updated))
    }

    fn save_args(args_file: &JsonConfigFile<T>) -> Result<()> {
        if let Some(path) = args_file.path.as_deref() {
            info!("Updating command line arguments file {:?}", path);
            args_file.save()?;
        }
        Ok(())
    }

    fn init_args_and_logging() -> Result<JsonConfigFile<T>> {
        let (args_file, updated) = Self::init_args_and_logging_nosave()?;
        if updated {
            Self::save_args(&args_file)?;
        }
        Ok(args_file)
    }
}

/// A json file which is written to a staging path first and then renamed
/// into place so that readers never see a partial file.
#[derive(Debug)]
pub struct JsonReportFile<T: JsonSave> {
    pub path: PathBuf,
    pub staging: PathBuf,
    pub data: T,
}

impl<T: JsonSave> JsonReportFile<T> {
    pub fn new<P: AsRef<Path>>(path_in: P, data: T) -> Self {
        let path = PathBuf::from(path_in.as_ref());
        let mut staging = path.clone().into_os_string();
        staging.push(".staging");

        Self {
            path,
            staging: PathBuf::from(staging),
            data,
        }
    }

    pub fn commit(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {:?}", parent))?;
            }
        }
        self.data
            .save(&self.staging)
            .with_context(|| format!("writing {:?}", &self.staging))?;
        fs::rename(&self.staging, &self.path)
            .with_context(|| format!("renaming {:?} to {:?}", &self.staging, &self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Knobs {
        name: String,
        count: u32,
    }

    impl JsonLoad for Knobs {}
    impl JsonSave for Knobs {}

    #[test]
    fn test_load_or_create_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/knobs.json");

        let cf = JsonConfigFile::<Knobs>::load_or_create(Some(&path)).unwrap();
        assert_eq!(cf.data, Knobs::default());
        assert!(path.exists());

        fs::write(&path, "// hand edited\n{\n  \"name\": \"x\",\n  # note\n  \"count\": 3\n}\n")
            .unwrap();
        let cf = JsonConfigFile::<Knobs>::load(&path).unwrap();
        assert_eq!(
            cf.data,
            Knobs {
                name: "x".into(),
                count: 3
            }
        );
    }

    #[test]
    fn test_report_file_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.json");
        let rf = JsonReportFile::new(
            &path,
            Knobs {
                name: "y".into(),
                count: 7,
            },
        );
        rf.commit().unwrap();
        assert!(!rf.staging.exists());
        assert_eq!(Knobs::load(&path).unwrap().count, 7);
    }
}
