//! Binary exchange files for running coupled to an external field
//! solver. The format is the legacy one: sequential records, each
//! framed by a little-endian i32 byte count before and after the
//! payload, with floating-point payloads as little-endian f64.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use log::debug;

use crate::error::HandoffError;

/// Per-step exchange header: an invocation flag byte, the field
/// solver's time step, then one (initial, final) pressure pair per
/// Dirichlet surface and one (initial, final) flow pair per Neumann
/// surface. Each field is its own framed record; the surface counts are
/// framed i32 records preceding the pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct CouplingHeader {
    pub flag: u8,
    pub timestep: f64,
    pub dirichlet: Vec<(f64, f64)>,
    pub neumann: Vec<(f64, f64)>,
}

impl CouplingHeader {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, HandoffError> {
        let path = path.as_ref();
        let mut file = open(path)?;
        let mut reader = RecordReader::new(&mut file, path);

        let flag = reader.read_flag()?;
        let timestep = reader.read_f64()?;
        let n_dirichlet = reader.read_count()?;
        let n_neumann = reader.read_count()?;

        let mut dirichlet = Vec::with_capacity(n_dirichlet);
        for _ in 0..n_dirichlet {
            dirichlet.push(reader.read_pair()?);
        }
        let mut neumann = Vec::with_capacity(n_neumann);
        for _ in 0..n_neumann {
            neumann.push(reader.read_pair()?);
        }
        debug!(
            "coupling header: flag {}, dt {}, {} dirichlet, {} neumann",
            flag, timestep, n_dirichlet, n_neumann
        );
        Ok(CouplingHeader {
            flag,
            timestep,
            dirichlet,
            neumann,
        })
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), HandoffError> {
        let path = path.as_ref();
        let mut file = create(path)?;
        let mut writer = RecordWriter::new(&mut file, path);

        writer.write_record(&[self.flag])?;
        writer.write_record(&self.timestep.to_le_bytes())?;
        writer.write_record(&(self.dirichlet.len() as i32).to_le_bytes())?;
        writer.write_record(&(self.neumann.len() as i32).to_le_bytes())?;
        for pair in self.dirichlet.iter().chain(self.neumann.iter()) {
            let mut payload = [0u8; 16];
            payload[..8].copy_from_slice(&pair.0.to_le_bytes());
            payload[8..].copy_from_slice(&pair.1.to_le_bytes());
            writer.write_record(&payload)?;
        }
        Ok(())
    }
}

/// Companion state carried across coupled steps: the running time and
/// the last pressure, framed like everything else. The field solver
/// does not create the file before the first step, so absence means
/// "use the built-in initial conditions".
#[derive(Debug, Clone, PartialEq)]
pub struct RestartRecord {
    pub time: f64,
    pub pressure: f64,
}

impl RestartRecord {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Option<Self>, HandoffError> {
        let path = path.as_ref();
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(HandoffError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let mut reader = RecordReader::new(&mut file, path);
        let time = reader.read_f64()?;
        let pressure = reader.read_f64()?;
        Ok(Some(RestartRecord { time, pressure }))
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), HandoffError> {
        let path = path.as_ref();
        let mut file = create(path)?;
        let mut writer = RecordWriter::new(&mut file, path);
        writer.write_record(&self.time.to_le_bytes())?;
        writer.write_record(&self.pressure.to_le_bytes())
    }
}

fn open(path: &Path) -> Result<File, HandoffError> {
    File::open(path).map_err(|source| HandoffError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn create(path: &Path) -> Result<File, HandoffError> {
    File::create(path).map_err(|source| HandoffError::Io {
        path: path.display().to_string(),
        source,
    })
}

struct RecordWriter<'a> {
    file: &'a mut File,
    path: &'a Path,
}

impl<'a> RecordWriter<'a> {
    fn new(file: &'a mut File, path: &'a Path) -> Self {
        RecordWriter { file, path }
    }

    fn write_record(&mut self, payload: &[u8]) -> Result<(), HandoffError> {
        let len = (payload.len() as i32).to_le_bytes();
        let mut buf = Vec::with_capacity(payload.len() + 8);
        buf.extend_from_slice(&len);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&len);
        self.file
            .write_all(&buf)
            .map_err(|source| HandoffError::Io {
                path: self.path.display().to_string(),
                source,
            })
    }
}

/// Sequential record decoder tracking the byte offset for diagnostics.
struct RecordReader<'a> {
    file: &'a mut File,
    path: &'a Path,
    offset: u64,
}

impl<'a> RecordReader<'a> {
    fn new(file: &'a mut File, path: &'a Path) -> Self {
        RecordReader {
            file,
            path,
            offset: 0,
        }
    }

    fn read_flag(&mut self) -> Result<u8, HandoffError> {
        let payload = self.read_record(1)?;
        Ok(payload[0])
    }

    fn read_f64(&mut self) -> Result<f64, HandoffError> {
        let start = self.offset;
        let payload = self.read_record(8)?;
        payload
            .as_slice()
            .try_into()
            .map(f64::from_le_bytes)
            .map_err(|_| HandoffError::Framing(start))
    }

    fn read_count(&mut self) -> Result<usize, HandoffError> {
        let start = self.offset;
        let payload = self.read_record(4)?;
        let count = payload
            .as_slice()
            .try_into()
            .map(i32::from_le_bytes)
            .map_err(|_| HandoffError::Framing(start))?;
        usize::try_from(count).map_err(|_| HandoffError::Framing(start))
    }

    fn read_pair(&mut self) -> Result<(f64, f64), HandoffError> {
        let start = self.offset;
        let payload = self.read_record(16)?;
        let split = |bytes: &[u8]| -> Result<f64, HandoffError> {
            bytes
                .try_into()
                .map(f64::from_le_bytes)
                .map_err(|_| HandoffError::Framing(start))
        };
        Ok((split(&payload[..8])?, split(&payload[8..])?))
    }

    /// One framed record whose payload must be exactly `expect` bytes.
    fn read_record(&mut self, expect: i32) -> Result<Vec<u8>, HandoffError> {
        let start = self.offset;
        let len = self.read_i32()?;
        if len != expect {
            return Err(HandoffError::Framing(start));
        }
        let mut payload = vec![0u8; len as usize];
        self.read_exact(&mut payload)?;
        let trailer = self.read_i32()?;
        if trailer != len {
            return Err(HandoffError::Length {
                got: trailer,
                want: len,
            });
        }
        Ok(payload)
    }

    fn read_i32(&mut self) -> Result<i32, HandoffError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), HandoffError> {
        self.file
            .read_exact(buf)
            .map_err(|source| HandoffError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        self.offset += buf.len() as u64;
        Ok(())
    }
}
