//! daemon configuration read from a json settings file.
//!
//! Command line flags override whatever is in here, the file just saves
//! typing them every launch.  Keys the daemon cares about: `port`, `name`,
//! `control`, and `connect_to` (a list of `name:host:port` strings).
use json::JsonValue;
use std::{
    fs::File,
    io::{ErrorKind, Write},
};

pub struct Config {
    filename: String,
    settings: JsonValue,
}

impl Config {
    pub fn build(filename: &str) -> Config {
        Config {
            filename: String::from(filename),
            settings: json::object! {},
        }
    }
    pub fn get_filename(&self) -> &str {
        &self.filename
    }
    pub fn load_from_file(&mut self) -> std::io::Result<bool> {
        match std::fs::read_to_string(&self.filename) {
            Ok(raw_data) => {
                match json::parse(&raw_data) {
                    Ok(parsed) => {
                        self.settings.clone_from(&parsed);
                        Ok(true)
                    }
                    Err(e) => Err(std::io::Error::new(
                        ErrorKind::InvalidData,
                        format!("bad json in {}: {}", self.filename, e),
                    )),
                }
            }
            Err(_) => {
                // call save settings to create a new file
                self.save_settings()
            }
        }
    }

    pub fn get_value<'a>(&'a self, key: &str, def_value: &'a str) -> &str {
        let val = self.settings[key].as_str();
        match val {
            None => def_value,
            Some(i) => i,
        }
    }

    pub fn get_u16_value(&self, key: &str, def_value: u16) -> u16 {
        let val = self.settings[key].as_u16();
        match val {
            None => def_value,
            Some(i) => i,
        }
    }

    /// get a list of strings (used for connect_to entries)
    pub fn get_list_value(&self, key: &str) -> Vec<String> {
        let mut vals: Vec<String> = vec![];
        for item in self.settings[key].members() {
            if let Some(s) = item.as_str() {
                vals.push(String::from(s));
            }
        }
        vals
    }

    pub fn set_value(&mut self, key: &str, val: &str) -> () {
        self.settings[key] = val.into();
    }

    pub fn dump(&self) {
        println!("config dump: {}", self.settings.pretty(2));
    }

    pub fn save_settings(&self) -> std::io::Result<bool> {
        let file_open_result = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.filename.as_str());
        match file_open_result {
            Ok(mut f) => self.flush_to_file(&mut f),
            Err(error) => {
                // File open failed.  See if we need to create it
                match error.kind() {
                    ErrorKind::NotFound => {
                        // no file, create one
                        let mut f = std::fs::File::create(self.filename.as_str())?;
                        self.flush_to_file(&mut f)
                    }
                    _other_error => Err(error),
                }
            }
        }
    }
    fn flush_to_file(&self, f: &mut File) -> std::io::Result<bool> {
        f.write_all(self.settings.pretty(2).as_bytes())?;
        f.sync_all()?;
        Ok(true)
    }
}
