// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use protos::remexec;
use protos::MessageExt;

/// A blob of file content, addressable by its digest.
#[derive(Clone)]
pub struct TestData {
    string: String,
}

impl TestData {
    pub fn empty() -> TestData {
        TestData::new("")
    }

    pub fn new(s: &str) -> TestData {
        TestData {
            string: s.to_owned(),
        }
    }

    pub fn bytes(&self) -> bytes::Bytes {
        bytes::Bytes::copy_from_slice(self.string.as_str().as_bytes())
    }

    pub fn fingerprint(&self) -> hashing::Fingerprint {
        self.digest().hash
    }

    pub fn digest(&self) -> hashing::Digest {
        hashing::Digest::of_bytes(&self.bytes())
    }

    pub fn string(&self) -> String {
        self.string.clone()
    }

    pub fn len(&self) -> usize {
        self.string.len()
    }
}

/// A `remexec::Directory` under construction, with digest helpers.
#[derive(Clone)]
pub struct TestDirectory {
    pub directory: remexec::Directory,
}

impl TestDirectory {
    pub fn empty() -> TestDirectory {
        TestDirectory {
            directory: remexec::Directory::default(),
        }
    }

    pub fn file(mut self, name: &str, data: &TestData, is_executable: bool) -> TestDirectory {
        self.directory.files.push(remexec::FileNode {
            name: name.to_owned(),
            digest: Some((&data.digest()).into()),
            is_executable,
        });
        self
    }

    pub fn symlink(mut self, name: &str, target: &str) -> TestDirectory {
        self.directory.symlinks.push(remexec::SymlinkNode {
            name: name.to_owned(),
            target: target.to_owned(),
        });
        self
    }

    pub fn dir(mut self, name: &str, child: &TestDirectory) -> TestDirectory {
        self.directory.directories.push(remexec::DirectoryNode {
            name: name.to_owned(),
            digest: Some((&child.digest()).into()),
        });
        self
    }

    pub fn directory(&self) -> remexec::Directory {
        self.directory.clone()
    }

    pub fn bytes(&self) -> bytes::Bytes {
        self.directory.to_bytes()
    }

    pub fn fingerprint(&self) -> hashing::Fingerprint {
        self.digest().hash
    }

    pub fn digest(&self) -> hashing::Digest {
        hashing::Digest::of_bytes(&self.bytes())
    }
}

/// A `remexec::Tree` with digest helpers. `children` must list every transitive child
/// `Directory`; duplicate listings are legal, as on the wire.
pub struct TestTree {
    pub tree: remexec::Tree,
}

impl TestTree {
    pub fn new(root: remexec::Directory, children: Vec<remexec::Directory>) -> Self {
        Self {
            tree: remexec::Tree {
                root: Some(root),
                children,
            },
        }
    }

    pub fn bytes(&self) -> bytes::Bytes {
        self.tree.to_bytes()
    }

    pub fn fingerprint(&self) -> hashing::Fingerprint {
        self.digest().hash
    }

    pub fn digest(&self) -> hashing::Digest {
        hashing::Digest::of_bytes(&self.bytes())
    }
}

impl From<TestDirectory> for TestTree {
    fn from(dir: TestDirectory) -> Self {
        Self::new(dir.directory(), vec![])
    }
}
