//! Kernel-side dispatch program for zero-copy receive.
//!
//! An XDP program on the interface redirects the configured queue into the
//! AF_XDP socket. Loading it is the job of an [`XdpLoader`]; the run only
//! needs the two maps it exposes and a handle that detaches the program when
//! dropped, whichever way the run ends.

use crate::{Error, Result};
use log::{debug, info, warn};
use std::os::unix::io::RawFd;

/// Map key used for both the queue id and the socket registration.
pub const DISPATCH_KEY: u32 = 0;

/// Default object file holding the dispatch program.
pub const DEFAULT_OBJECT: &str = "xsock_dispatch.o";

/// A BPF map with `u32` keys and values.
pub trait XdpMap: Send {
    fn update(&self, key: u32, value: u32) -> Result<()>;
}

/// A program attached to an interface.
pub trait XdpProgram: Send {
    fn detach(&mut self) -> Result<()>;
}

/// Loads and attaches the dispatch program.
pub trait XdpLoader {
    fn attach(&self, interface: &str, queue: u32) -> Result<XdpAttachment>;
}

/// The attached program and its maps. Dropping it detaches the program.
pub struct XdpAttachment {
    queue_map: Box<dyn XdpMap>,
    socket_map: Box<dyn XdpMap>,
    program: Option<Box<dyn XdpProgram>>,
}

impl XdpAttachment {
    pub fn new(
        queue_map: Box<dyn XdpMap>,
        socket_map: Box<dyn XdpMap>,
        program: Box<dyn XdpProgram>,
    ) -> Self {
        Self {
            queue_map,
            socket_map,
            program: Some(program),
        }
    }

    /// Points the program at `queue` and registers the socket that receives it.
    pub fn register(&self, queue: u32, socket_fd: RawFd) -> Result<()> {
        self.queue_map.update(DISPATCH_KEY, queue)?;
        let fd = u32::try_from(socket_fd)
            .map_err(|_| Error::Resource(format!("invalid socket fd {}", socket_fd)))?;
        self.socket_map.update(DISPATCH_KEY, fd)?;
        debug!("Registered socket {} for queue {}", socket_fd, queue);
        Ok(())
    }

    /// Detaches now, reporting failure instead of only logging it.
    pub fn detach(mut self) -> Result<()> {
        match self.program.take() {
            Some(mut program) => program.detach(),
            None => Ok(()),
        }
    }
}

impl Drop for XdpAttachment {
    fn drop(&mut self) {
        if let Some(mut program) = self.program.take() {
            if let Err(e) = program.detach() {
                warn!("Failed to detach XDP program: {}", e);
            }
        }
    }
}

/// Loader used when the crate is built without libbpf.
pub struct UnavailableLoader;

impl XdpLoader for UnavailableLoader {
    fn attach(&self, interface: &str, _queue: u32) -> Result<XdpAttachment> {
        Err(Error::Resource(format!(
            "cannot attach XDP program to {}: built without the `bpf` feature",
            interface
        )))
    }
}

#[cfg(feature = "bpf")]
pub use self::libbpf::LibbpfLoader;

/// The loader this build ships with.
pub fn default_loader() -> Box<dyn XdpLoader> {
    #[cfg(feature = "bpf")]
    {
        Box::new(LibbpfLoader::new(DEFAULT_OBJECT))
    }
    #[cfg(not(feature = "bpf"))]
    {
        info!("XDP program loading unavailable in this build");
        Box::new(UnavailableLoader)
    }
}

#[cfg(feature = "bpf")]
mod libbpf {
    use super::{XdpAttachment, XdpLoader, XdpMap, XdpProgram};
    use crate::transport::sys;
    use crate::{Error, Result};
    use libbpf_sys::{
        bpf_map__fd, bpf_map_update_elem, bpf_object, bpf_object__close,
        bpf_object__find_map_by_name, bpf_object__load, bpf_object__next_program,
        bpf_object__open_file, bpf_program__fd, bpf_xdp_attach, bpf_xdp_detach,
    };
    use log::info;
    use std::ffi::CString;
    use std::path::PathBuf;
    use std::ptr;
    use std::sync::Arc;

    const XDP_FLAGS_DRV_MODE: u32 = 1 << 2;

    /// Owns the loaded object; closed once every map and the link are gone.
    struct Object(*mut bpf_object);

    // SAFETY: libbpf objects are not tied to the creating thread.
    unsafe impl Send for Object {}
    unsafe impl Sync for Object {}

    impl Drop for Object {
        fn drop(&mut self) {
            // SAFETY: closing the object we opened.
            unsafe { bpf_object__close(self.0) }
        }
    }

    struct Map {
        fd: i32,
        _object: Arc<Object>,
    }

    impl XdpMap for Map {
        fn update(&self, key: u32, value: u32) -> Result<()> {
            // SAFETY: key and value are live u32s, matching the map layout.
            let ret = unsafe {
                bpf_map_update_elem(
                    self.fd,
                    &key as *const u32 as *const _,
                    &value as *const u32 as *const _,
                    0,
                )
            };
            if ret != 0 {
                return Err(Error::resource(
                    "bpf_map_update_elem",
                    std::io::Error::from_raw_os_error(-ret),
                ));
            }
            Ok(())
        }
    }

    struct Link {
        ifindex: i32,
        _object: Arc<Object>,
    }

    impl XdpProgram for Link {
        fn detach(&mut self) -> Result<()> {
            // SAFETY: detaching the program we attached to `ifindex`.
            let ret = unsafe { bpf_xdp_detach(self.ifindex, XDP_FLAGS_DRV_MODE, ptr::null()) };
            if ret != 0 {
                return Err(Error::resource(
                    "bpf_xdp_detach",
                    std::io::Error::from_raw_os_error(-ret),
                ));
            }
            info!("XDP program detached from ifindex {}", self.ifindex);
            Ok(())
        }
    }

    /// Loads the dispatch object from a file with libbpf.
    pub struct LibbpfLoader {
        path: PathBuf,
    }

    impl LibbpfLoader {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        fn map(object: &Arc<Object>, name: &str) -> Result<Box<dyn XdpMap>> {
            let cname = CString::new(name).map_err(|_| Error::Config(name.to_string()))?;
            // SAFETY: valid object and C string.
            let fd = unsafe {
                let map = bpf_object__find_map_by_name(object.0, cname.as_ptr());
                if map.is_null() {
                    -1
                } else {
                    bpf_map__fd(map)
                }
            };
            if fd < 0 {
                return Err(Error::Resource(format!("no {} found", name)));
            }
            Ok(Box::new(Map {
                fd,
                _object: Arc::clone(object),
            }))
        }
    }

    impl XdpLoader for LibbpfLoader {
        fn attach(&self, interface: &str, _queue: u32) -> Result<XdpAttachment> {
            let ifindex = sys::if_index(interface)? as i32;
            let path = CString::new(self.path.to_string_lossy().as_bytes())
                .map_err(|_| Error::Config(format!("bad object path {:?}", self.path)))?;

            // SAFETY: valid C string, default options.
            let raw = unsafe { bpf_object__open_file(path.as_ptr(), ptr::null()) };
            if raw.is_null() {
                return Err(Error::Resource(format!(
                    "no program found in {}",
                    self.path.display()
                )));
            }
            let object = Arc::new(Object(raw));

            // SAFETY: `object` is open.
            if unsafe { bpf_object__load(object.0) } != 0 {
                return Err(Error::Resource(format!(
                    "failed to load {}",
                    self.path.display()
                )));
            }

            // SAFETY: `object` is loaded; the first program is the dispatcher.
            let prog_fd = unsafe {
                let prog = bpf_object__next_program(object.0, ptr::null_mut());
                if prog.is_null() {
                    -1
                } else {
                    bpf_program__fd(prog)
                }
            };
            if prog_fd < 0 {
                return Err(Error::Resource("no program found".into()));
            }

            let queue_map = Self::map(&object, "qidconf_map")?;
            let socket_map = Self::map(&object, "xsks_map")?;

            // SAFETY: valid program fd and interface index.
            let ret = unsafe { bpf_xdp_attach(ifindex, prog_fd, XDP_FLAGS_DRV_MODE, ptr::null()) };
            if ret != 0 {
                return Err(Error::resource(
                    "link set xdp fd",
                    std::io::Error::from_raw_os_error(-ret),
                ));
            }
            info!("XDP program attached to {} in driver mode", interface);

            Ok(XdpAttachment::new(
                queue_map,
                socket_map,
                Box::new(Link {
                    ifindex,
                    _object: object,
                }),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeMap(Arc<Mutex<HashMap<u32, u32>>>);

    impl XdpMap for FakeMap {
        fn update(&self, key: u32, value: u32) -> Result<()> {
            self.0.lock().unwrap().insert(key, value);
            Ok(())
        }
    }

    struct FakeProgram(Arc<Mutex<u32>>);

    impl XdpProgram for FakeProgram {
        fn detach(&mut self) -> Result<()> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn attachment() -> (XdpAttachment, FakeMap, FakeMap, Arc<Mutex<u32>>) {
        let queue_map = FakeMap::default();
        let socket_map = FakeMap::default();
        let detached = Arc::new(Mutex::new(0));
        let att = XdpAttachment::new(
            Box::new(queue_map.clone()),
            Box::new(socket_map.clone()),
            Box::new(FakeProgram(Arc::clone(&detached))),
        );
        (att, queue_map, socket_map, detached)
    }

    #[test]
    fn test_register_writes_fixed_key() {
        let (att, queue_map, socket_map, _) = attachment();
        att.register(3, 17).unwrap();
        assert_eq!(queue_map.0.lock().unwrap().get(&DISPATCH_KEY), Some(&3));
        assert_eq!(socket_map.0.lock().unwrap().get(&DISPATCH_KEY), Some(&17));
        assert!(att.register(0, -1).is_err());
    }

    #[test]
    fn test_detach_on_drop_exactly_once() {
        let (att, _, _, detached) = attachment();
        drop(att);
        assert_eq!(*detached.lock().unwrap(), 1);

        let (att, _, _, detached) = attachment();
        att.detach().unwrap();
        assert_eq!(*detached.lock().unwrap(), 1);
    }

    #[test]
    fn test_unavailable_loader() {
        assert!(matches!(
            UnavailableLoader.attach("eth0", 0).map(|_| ()),
            Err(Error::Resource(_))
        ));
    }
}
