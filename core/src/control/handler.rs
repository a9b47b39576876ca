//! Control-plane request application
//!
//! `ServerState` owns everything the control plane may touch: the device
//! map, ID reservations and the image folder. `apply()` runs on the
//! reactor thread between bus commands, so no locking is needed around
//! the device map.

use std::fs;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use log::*;
use log::LevelFilter;

use super::proto::{ControlError, ControlRequest, ControlResponse, ControlResult, DeviceInfo};
use crate::image::{media_hint, open_image, probe_geometry, AccessMode, ImageProperties, MediaHint};
use crate::targets::bridge::ScsiBridge;
use crate::targets::cdrom::ScsiCdrom;
use crate::targets::daynaport::ScsiDaynaPort;
use crate::targets::disk::ScsiDisk;
use crate::targets::hostservices::{ScsiHostServices, SystemAction};
use crate::targets::printer::ScsiPrinter;
use crate::targets::{DeviceClass, DeviceMap, LogicalUnit, LUN_MAX};

pub struct ServerState {
    pub devices: DeviceMap,
    pub reserved_ids: [bool; 8],
    pub image_folder: PathBuf,
    pub access_mode: AccessMode,
    actions_tx: Sender<SystemAction>,
}

impl ServerState {
    pub fn new(image_folder: PathBuf, access_mode: AccessMode, actions_tx: Sender<SystemAction>) -> Self {
        Self {
            devices: DeviceMap::default(),
            reserved_ids: [false; 8],
            image_folder,
            access_mode,
            actions_tx,
        }
    }

    pub fn apply(&mut self, request: &ControlRequest) -> ControlResult {
        match request {
            ControlRequest::Attach {
                id,
                lun,
                class,
                file,
                block_size,
                name,
            } => self.attach(*id, *lun, *class, file.as_deref(), *block_size, name.as_deref()),
            ControlRequest::Detach { id, lun } => self.detach(*id, *lun),
            ControlRequest::Insert { id, lun, file } => self.insert(*id, *lun, file),
            ControlRequest::Eject { id, lun } => self.eject(*id, *lun),
            ControlRequest::Protect { id, lun } => self.protect(*id, *lun, true),
            ControlRequest::Unprotect { id, lun } => self.protect(*id, *lun, false),
            ControlRequest::DevicesInfo => Ok(ControlResponse::Devices {
                devices: self.device_infos(),
            }),
            ControlRequest::ServerInfo => Ok(ControlResponse::Server {
                version: crate::build_version(),
                image_folder: self.image_folder.clone(),
                reserved_ids: self.reserved_list(),
                log_level: log::max_level().to_string(),
            }),
            ControlRequest::LogLevel { level } => {
                let filter: LevelFilter = level.parse().map_err(|_| ControlError::Invalid {
                    message: format!("Unknown log level '{level}'"),
                })?;
                log::set_max_level(filter);
                info!("Log level set to {filter}");
                Ok(ControlResponse::Ok)
            }
            ControlRequest::ReservedIds { ids } => match ids {
                Some(ids) => self.reserve_ids(ids),
                None => Ok(ControlResponse::ReservedIds {
                    ids: self.reserved_list(),
                }),
            },
            ControlRequest::CreateImage { file, size } => self.create_image(file, *size),
            ControlRequest::DeleteImage { file } => self.delete_image(file),
            ControlRequest::RenameImage { from, to } => self.rename_image(from, to),
            ControlRequest::DefaultImageFolder { path } => match path {
                Some(p) => {
                    if !p.is_dir() {
                        return Err(ControlError::Image {
                            message: format!("{} is not a directory", p.display()),
                        });
                    }
                    self.image_folder = p.clone();
                    Ok(ControlResponse::Ok)
                }
                None => Ok(ControlResponse::ImageFolder {
                    path: self.image_folder.clone(),
                }),
            },
            // The orchestrator latches its shutdown flag before apply()
            ControlRequest::StopBus | ControlRequest::Shutdown => Ok(ControlResponse::Ok),
        }
    }

    fn check_address(&self, id: u8, lun: u8) -> Result<(), ControlError> {
        if id >= 8 {
            return Err(ControlError::InvalidId { id });
        }
        if lun >= LUN_MAX {
            return Err(ControlError::InvalidLun { lun });
        }
        Ok(())
    }

    fn resolve_path(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.image_folder.join(file)
        }
    }

    /// A bare file name inside the image folder; separators are refused
    /// so control clients cannot step outside it.
    fn folder_file(&self, name: &str) -> Result<PathBuf, ControlError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ControlError::Image {
                message: format!("Invalid image name '{name}'"),
            });
        }
        Ok(self.image_folder.join(name))
    }

    fn open_media(
        &self,
        path: &Path,
        class: DeviceClass,
        block_size: Option<usize>,
    ) -> Result<(Box<dyn crate::image::ImageHandle>, ImageProperties), ControlError> {
        let image_err = |message: String| ControlError::Image { message };

        if !path.exists() {
            return Err(image_err(format!("File not found: {}", path.display())));
        }

        match (media_hint(path), class) {
            (Some(MediaHint::HardDisk), DeviceClass::Hd | DeviceClass::Rm) => (),
            (Some(MediaHint::Mo), DeviceClass::Mo) => (),
            (Some(MediaHint::Cd), DeviceClass::Cd) => (),
            (None, _) => (),
            (Some(hint), class) => {
                warn!(
                    "Image {} looks like {:?} but is attached as {}",
                    path.display(),
                    hint,
                    class
                );
            }
        }

        let props = ImageProperties::load_for(path).map_err(|e| image_err(format!("{e:#}")))?;
        let default_size = if class == DeviceClass::Cd { 2048 } else { 512 };
        let block_size = block_size.or(props.block_size).unwrap_or(default_size);

        let geometry =
            probe_geometry(path, block_size).map_err(|e| image_err(format!("{e:#}")))?;
        let image = open_image(path, geometry, self.access_mode)
            .map_err(|e| image_err(format!("{e:#}")))?;
        Ok((image, props))
    }

    #[allow(clippy::too_many_lines)]
    fn attach(
        &mut self,
        id: u8,
        lun: u8,
        class: DeviceClass,
        file: Option<&Path>,
        block_size: Option<usize>,
        name: Option<&str>,
    ) -> ControlResult {
        self.check_address(id, lun)?;
        if self.reserved_ids[usize::from(id)] {
            return Err(ControlError::ReservedId { id });
        }
        if self.devices.target(id).unit(lun).is_some() {
            return Err(ControlError::Occupied { id, lun });
        }

        let (image, props) = match file {
            Some(f) => {
                let path = self.resolve_path(f);
                let (image, props) = self.open_media(&path, class, block_size)?;
                (Some(image), Some(props))
            }
            None => (None, None),
        };

        let invalid = |e: anyhow::Error| ControlError::Invalid {
            message: format!("{e:#}"),
        };

        let mut unit: Box<dyn LogicalUnit> = match class {
            DeviceClass::Hd | DeviceClass::Rm | DeviceClass::Mo => match image {
                Some(image) => {
                    Box::new(ScsiDisk::with_image(class, id, lun, image).map_err(invalid)?)
                }
                // Fixed disks need media; removables may attach empty
                None if class == DeviceClass::Hd => {
                    return Err(ControlError::FileRequired { class })
                }
                None => Box::new(ScsiDisk::new(class, id, lun).map_err(invalid)?),
            },
            DeviceClass::Cd => match image {
                Some(image) => Box::new(ScsiCdrom::with_image(id, lun, image)),
                None => Box::new(ScsiCdrom::new(id, lun)),
            },
            DeviceClass::Dp => Box::new(ScsiDaynaPort::new(id, lun)),
            DeviceClass::Lp => Box::new(ScsiPrinter::new(id, lun)),
            DeviceClass::Br => Box::new(ScsiBridge::new(id, lun)),
            DeviceClass::Hs => Box::new(ScsiHostServices::new(id, lun, self.actions_tx.clone())),
        };

        if let Some(props) = &props {
            unit.core_mut().apply_properties(props);
        }
        if let Some(name) = name {
            apply_name_override(unit.core_mut(), name);
        }

        info!("Attached {} at {}:{}", class, id, lun);
        self.devices.target_mut(id).attach(lun, unit).map_err(|_| {
            ControlError::Occupied { id, lun }
        })?;
        Ok(ControlResponse::Ok)
    }

    fn detach(&mut self, id: u8, lun: u8) -> ControlResult {
        self.check_address(id, lun)?;
        match self.devices.target_mut(id).detach(lun) {
            Some(mut unit) => {
                if let Err(e) = unit.flush_media() {
                    error!("Flush on detach of {id}:{lun} failed: {e}");
                }
                info!("Detached {id}:{lun}");
                Ok(ControlResponse::Ok)
            }
            None => Err(ControlError::NoDevice { id, lun }),
        }
    }

    fn insert(&mut self, id: u8, lun: u8, file: &Path) -> ControlResult {
        self.check_address(id, lun)?;
        let path = self.resolve_path(file);

        // Validate the target before opening anything
        let class = match self.devices.target(id).unit(lun) {
            None => return Err(ControlError::NoDevice { id, lun }),
            Some(u) if !u.class().removable() => return Err(ControlError::Unsupported),
            Some(u) if u.core().image.is_some() => {
                return Err(ControlError::Invalid {
                    message: "Medium already loaded".into(),
                })
            }
            Some(u) => u.class(),
        };

        let (image, props) = self.open_media(&path, class, None)?;

        let unit = self
            .devices
            .target_mut(id)
            .unit_mut(lun)
            .expect("unit vanished");
        unit.core_mut().apply_properties(&props);
        unit.insert_media(image)
            .map_err(|e| ControlError::Invalid { message: format!("{e:#}") })?;
        info!("Inserted {} into {id}:{lun}", path.display());
        Ok(ControlResponse::Ok)
    }

    fn eject(&mut self, id: u8, lun: u8) -> ControlResult {
        self.check_address(id, lun)?;
        let Some(unit) = self.devices.target_mut(id).unit_mut(lun) else {
            return Err(ControlError::NoDevice { id, lun });
        };
        if !unit.class().removable() {
            return Err(ControlError::Unsupported);
        }
        unit.eject_media(false)
            .map_err(|e| ControlError::Invalid { message: format!("{e:#}") })?;
        info!("Ejected medium from {id}:{lun}");
        Ok(ControlResponse::Ok)
    }

    fn protect(&mut self, id: u8, lun: u8, protect: bool) -> ControlResult {
        self.check_address(id, lun)?;
        let Some(unit) = self.devices.target_mut(id).unit_mut(lun) else {
            return Err(ControlError::NoDevice { id, lun });
        };
        if !unit.class().block_device() {
            return Err(ControlError::Unsupported);
        }
        unit.core_mut().protected = protect;
        Ok(ControlResponse::Ok)
    }

    fn device_infos(&self) -> Vec<DeviceInfo> {
        let mut out = Vec::new();
        for (id, lun) in self.devices.addresses() {
            let Some(unit) = self.devices.target(id).unit(lun) else {
                continue;
            };
            let core = unit.core();
            let (blocks, block_size) = unit.capacity().unwrap_or((0, 0));
            out.push(DeviceInfo {
                id,
                lun,
                class: core.class,
                file: core.image.as_ref().map(|i| i.path().to_path_buf()),
                blocks,
                block_size,
                removable: core.class.removable(),
                protected: core.write_protected(),
                locked: core.locked,
                media_present: core.image.is_some() || !core.class.block_device(),
                vendor: core.vendor.clone(),
                product: core.product.clone(),
                revision: core.revision.clone(),
            });
        }
        out
    }

    fn reserved_list(&self) -> Vec<u8> {
        (0..8u8)
            .filter(|&id| self.reserved_ids[usize::from(id)])
            .collect()
    }

    fn reserve_ids(&mut self, ids: &[u8]) -> ControlResult {
        let mut new_set = [false; 8];
        for &id in ids {
            if id >= 8 {
                return Err(ControlError::InvalidId { id });
            }
            if self.devices.target(id).has_units() {
                return Err(ControlError::Invalid {
                    message: format!("ID {id} has attached devices"),
                });
            }
            new_set[usize::from(id)] = true;
        }
        self.reserved_ids = new_set;
        info!("Reserved IDs: {:?}", self.reserved_list());
        Ok(ControlResponse::Ok)
    }

    fn create_image(&self, file: &str, size: u64) -> ControlResult {
        let path = self.folder_file(file)?;
        if path.exists() {
            return Err(ControlError::Image {
                message: format!("{} already exists", path.display()),
            });
        }
        if size == 0 || size % 512 != 0 {
            return Err(ControlError::Invalid {
                message: format!("Image size {size} is not a positive multiple of 512"),
            });
        }

        let create = || -> std::io::Result<()> {
            let f = fs::File::create(&path)?;
            f.set_len(size)?;
            Ok(())
        };
        create().map_err(|e| ControlError::Image {
            message: format!("Cannot create {}: {e}", path.display()),
        })?;
        info!("Created image {} ({} bytes)", path.display(), size);
        Ok(ControlResponse::Ok)
    }

    fn delete_image(&self, file: &str) -> ControlResult {
        let path = self.folder_file(file)?;
        fs::remove_file(&path).map_err(|e| ControlError::Image {
            message: format!("Cannot delete {}: {e}", path.display()),
        })?;

        // The sidecar goes with the image
        let mut sidecar = path.into_os_string();
        sidecar.push(".properties");
        let _ = fs::remove_file(PathBuf::from(sidecar));
        Ok(ControlResponse::Ok)
    }

    fn rename_image(&self, from: &str, to: &str) -> ControlResult {
        let from = self.folder_file(from)?;
        let to = self.folder_file(to)?;
        if to.exists() {
            return Err(ControlError::Image {
                message: format!("{} already exists", to.display()),
            });
        }
        fs::rename(&from, &to).map_err(|e| ControlError::Image {
            message: format!("Cannot rename {}: {e}", from.display()),
        })?;
        Ok(ControlResponse::Ok)
    }
}

fn apply_name_override(core: &mut crate::targets::UnitCore, name: &str) {
    let mut parts = name.splitn(3, ':');
    if let Some(v) = parts.next().filter(|s| !s.is_empty()) {
        core.vendor = v.into();
    }
    if let Some(p) = parts.next().filter(|s| !s.is_empty()) {
        core.product = p.into();
    }
    if let Some(r) = parts.next().filter(|s| !s.is_empty()) {
        core.revision = r.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn state(dir: &tempfile::TempDir) -> ServerState {
        let (tx, _rx) = crossbeam_channel::unbounded();
        ServerState::new(dir.path().to_path_buf(), AccessMode::Raw, tx)
    }

    fn make_image(dir: &tempfile::TempDir, name: &str, bytes: usize) {
        fs::write(dir.path().join(name), vec![0u8; bytes]).unwrap();
    }

    fn attach_req(id: u8, class: DeviceClass, file: Option<&str>) -> ControlRequest {
        ControlRequest::Attach {
            id,
            lun: 0,
            class,
            file: file.map(PathBuf::from),
            block_size: None,
            name: None,
        }
    }

    #[test]
    fn attach_and_detach_hd() {
        let dir = tempfile::tempdir().unwrap();
        make_image(&dir, "disk.hds", 512 * 16);
        let mut st = state(&dir);

        st.apply(&attach_req(1, DeviceClass::Hd, Some("disk.hds")))
            .unwrap();
        assert!(st.devices.target(1).unit(0).is_some());

        // Double attach is refused
        let err = st
            .apply(&attach_req(1, DeviceClass::Hd, Some("disk.hds")))
            .unwrap_err();
        assert!(matches!(err, ControlError::Occupied { id: 1, lun: 0 }));

        st.apply(&ControlRequest::Detach { id: 1, lun: 0 }).unwrap();
        assert!(st.devices.target(1).unit(0).is_none());
    }

    #[test]
    fn attach_hd_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = state(&dir);
        let err = st.apply(&attach_req(0, DeviceClass::Hd, None)).unwrap_err();
        assert!(matches!(err, ControlError::FileRequired { .. }));
    }

    #[test]
    fn attach_missing_file_is_an_image_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = state(&dir);
        let err = st
            .apply(&attach_req(0, DeviceClass::Hd, Some("ghost.hds")))
            .unwrap_err();
        assert!(matches!(err, ControlError::Image { .. }));
    }

    #[test]
    fn reserved_id_blocks_attach() {
        let dir = tempfile::tempdir().unwrap();
        make_image(&dir, "disk.hds", 512 * 16);
        let mut st = state(&dir);

        st.apply(&ControlRequest::ReservedIds {
            ids: Some(vec![3]),
        })
        .unwrap();
        let err = st
            .apply(&attach_req(3, DeviceClass::Hd, Some("disk.hds")))
            .unwrap_err();
        assert!(matches!(err, ControlError::ReservedId { id: 3 }));
    }

    #[test]
    fn insert_eject_removable() {
        let dir = tempfile::tempdir().unwrap();
        make_image(&dir, "cd.iso", 2048 * 8);
        let mut st = state(&dir);

        st.apply(&attach_req(2, DeviceClass::Cd, None)).unwrap();

        st.apply(&ControlRequest::Insert {
            id: 2,
            lun: 0,
            file: PathBuf::from("cd.iso"),
        })
        .unwrap();
        assert!(st.devices.target(2).unit(0).unwrap().core().image.is_some());

        // Second insert refused
        let err = st
            .apply(&ControlRequest::Insert {
                id: 2,
                lun: 0,
                file: PathBuf::from("cd.iso"),
            })
            .unwrap_err();
        assert!(matches!(err, ControlError::Invalid { .. }));

        st.apply(&ControlRequest::Eject { id: 2, lun: 0 }).unwrap();
        assert!(st.devices.target(2).unit(0).unwrap().core().image.is_none());
    }

    #[test]
    fn insert_into_fixed_disk_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        make_image(&dir, "disk.hds", 512 * 16);
        let mut st = state(&dir);
        st.apply(&attach_req(0, DeviceClass::Hd, Some("disk.hds")))
            .unwrap();

        let err = st
            .apply(&ControlRequest::Insert {
                id: 0,
                lun: 0,
                file: PathBuf::from("disk.hds"),
            })
            .unwrap_err();
        assert!(matches!(err, ControlError::Unsupported));
    }

    #[test]
    fn protect_toggles_write_protection() {
        let dir = tempfile::tempdir().unwrap();
        make_image(&dir, "disk.hds", 512 * 16);
        let mut st = state(&dir);
        st.apply(&attach_req(0, DeviceClass::Hd, Some("disk.hds")))
            .unwrap();

        st.apply(&ControlRequest::Protect { id: 0, lun: 0 }).unwrap();
        assert!(st.devices.target(0).unit(0).unwrap().core().write_protected());

        st.apply(&ControlRequest::Unprotect { id: 0, lun: 0 })
            .unwrap();
        assert!(!st.devices.target(0).unit(0).unwrap().core().write_protected());
    }

    #[test]
    fn devices_info_lists_units() {
        let dir = tempfile::tempdir().unwrap();
        make_image(&dir, "disk.hds", 512 * 16);
        let mut st = state(&dir);
        st.apply(&attach_req(0, DeviceClass::Hd, Some("disk.hds")))
            .unwrap();
        st.apply(&attach_req(4, DeviceClass::Dp, None)).unwrap();

        let ControlResponse::Devices { devices } = st.apply(&ControlRequest::DevicesInfo).unwrap()
        else {
            panic!("wrong response");
        };
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].class, DeviceClass::Hd);
        assert_eq!(devices[0].blocks, 16);
        assert_eq!(devices[1].class, DeviceClass::Dp);
    }

    #[test]
    fn create_delete_rename_image() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(&dir);

        st.create_image("new.hds", 512 * 32).unwrap();
        assert_eq!(fs::metadata(dir.path().join("new.hds")).unwrap().len(), 512 * 32);

        // Existing file and bad sizes refused
        assert!(st.create_image("new.hds", 512).is_err());
        assert!(st.create_image("odd.hds", 1000).is_err());

        st.rename_image("new.hds", "renamed.hds").unwrap();
        assert!(dir.path().join("renamed.hds").exists());

        st.delete_image("renamed.hds").unwrap();
        assert!(!dir.path().join("renamed.hds").exists());
    }

    #[test]
    fn image_names_cannot_escape_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(&dir);
        assert!(st.create_image("../escape.hds", 512).is_err());
        assert!(st.create_image("a/b.hds", 512).is_err());
        assert!(st.delete_image("..").is_err());
    }

    #[test]
    fn name_override_parsing() {
        let dir = tempfile::tempdir().unwrap();
        make_image(&dir, "disk.hds", 512 * 16);
        let mut st = state(&dir);

        st.apply(&ControlRequest::Attach {
            id: 0,
            lun: 0,
            class: DeviceClass::Hd,
            file: Some(PathBuf::from("disk.hds")),
            block_size: None,
            name: Some("ACME:SUPERDISK:2.0".into()),
        })
        .unwrap();

        let core = st.devices.target(0).unit(0).unwrap().core();
        assert_eq!(core.vendor, "ACME");
        assert_eq!(core.product, "SUPERDISK");
        assert_eq!(core.revision, "2.0");
    }

    #[test]
    fn properties_sidecar_applied_on_attach() {
        let dir = tempfile::tempdir().unwrap();
        make_image(&dir, "disk.hds", 1024 * 16);
        fs::write(
            dir.path().join("disk.hds.properties"),
            r#"{"vendor": "RETRO", "block_size": 1024}"#,
        )
        .unwrap();
        let mut st = state(&dir);

        st.apply(&attach_req(0, DeviceClass::Hd, Some("disk.hds")))
            .unwrap();
        let unit = st.devices.target(0).unit(0).unwrap();
        assert_eq!(unit.core().vendor, "RETRO");
        assert_eq!(unit.capacity(), Some((16, 1024)));
    }
}
