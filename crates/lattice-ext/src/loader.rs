//! loader.rs — chargeur d'extensions dynamiques (C7, §4.7).
//!
//! Résolution de chemin, chargement "tout résoudre tout de suite" (pas de
//! lazy binding façon `RTLD_LAZY`), appel du symbole d'initialisation fixe,
//! puis enregistrement direct des fonctions exposées dans la
//! [`NativeRegistry`] de l'hôte — les fonctions d'extension partagent donc
//! l'espace [`NativeId`] des natifs C6 et sont invoquées par la VM via le
//! même chemin (`Dispatch::Extension` porte un `ExtensionId` qui aliase un
//! `NativeId`, voir `lattice-vm::vm`).

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};

use lattice_core::value::{lat_str, Closure, Dispatch, ExtensionId, OrderedMap, Value};
use lattice_runtime::registry::NativeFn;
use lattice_runtime::NativeRegistry;

use crate::error::{ExtError, ExtResult};

/// Nom du symbole que toute bibliothèque d'extension doit exporter.
pub const INIT_SYMBOL: &[u8] = b"lattice_extension_init";

/// Suffixe de bibliothèque partagée par plateforme.
#[cfg(target_os = "linux")]
const DYLIB_SUFFIX: &str = "so";
#[cfg(target_os = "macos")]
const DYLIB_SUFFIX: &str = "dylib";
#[cfg(target_os = "windows")]
const DYLIB_SUFFIX: &str = "dll";

/// Signature du symbole d'initialisation : reçoit un contexte d'enregistrement
/// que l'extension peuple avec ses paires `(nom, fonction)`.
pub type InitFn = unsafe extern "C" fn(&mut RegistrationContext);

/// Contexte passé à l'initialiseur d'une extension. Collecte les paires
/// nom/fonction sans connaître encore leur [`lattice_core::value::NativeId`]
/// final — l'attribution a lieu une fois le contexte rendu au chargeur.
#[derive(Default)]
pub struct RegistrationContext {
    pending: Vec<(String, NativeFn)>,
}

impl RegistrationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appelé depuis l'initialiseur d'une extension pour exposer `name`.
    pub fn register(&mut self, name: &str, func: NativeFn) {
        self.pending.push((name.to_string(), func));
    }
}

/// Chargeur d'extensions : conserve chaque bibliothèque ouverte en vie pour
/// la durée du processus (§4.7 : "the library handle is retained for the
/// lifetime of the process").
#[derive(Default)]
pub struct ExtensionLoader {
    libraries: Vec<Library>,
    loaded: Vec<String>,
    search_dirs: Vec<PathBuf>,
}

impl ExtensionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute un répertoire de recherche explicite, consulté avant les
    /// emplacements par défaut.
    pub fn add_search_dir(&mut self, dir: impl Into<PathBuf>) {
        self.search_dirs.push(dir.into());
    }

    /// Ordre de résolution (§6), quatre emplacements fixes — pas de
    /// préfixe `lib`, chaque nom vaut pour exactement un fichier :
    /// 1. `./extensions/<name>.<suffix>` ;
    /// 2. `./extensions/<name>/<name>.<suffix>` (extension dans son propre
    ///    sous-répertoire) ;
    /// 3. `~/.lattice/ext/<name>.<suffix>`, résolu via `HOME` ;
    /// 4. `$LATTICE_EXT_PATH/<name>.<suffix>`.
    /// [`Self::add_search_dir`] ajoute des répertoires essayés *avant* ces
    /// quatre emplacements, dans le même format `<dir>/<name>.<suffix>`.
    fn search_paths(&self, name: &str) -> Vec<PathBuf> {
        let filename = format!("{name}.{DYLIB_SUFFIX}");
        let mut candidates: Vec<PathBuf> =
            self.search_dirs.iter().map(|dir| dir.join(&filename)).collect();

        candidates.push(PathBuf::from("extensions").join(&filename));
        candidates.push(PathBuf::from("extensions").join(name).join(&filename));

        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".lattice").join("ext").join(&filename));
        }

        if let Ok(ext_path) = env::var("LATTICE_EXT_PATH") {
            candidates.push(PathBuf::from(ext_path).join(&filename));
        }

        candidates
    }

    fn resolve_path(&self, name: &str) -> ExtResult<PathBuf> {
        self.search_paths(name)
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| ExtError::NotFound(name.to_string()))
    }

    /// Charge l'extension `name`, enregistre ses fonctions dans `registry`
    /// et renvoie la `Map` de fermeures EXTENSION exposée au programme
    /// Lattice (§4.7 : "a Map of Closures marked as extension dispatch").
    pub fn load(&mut self, name: &str, registry: &mut NativeRegistry) -> ExtResult<Value> {
        if self.loaded.iter().any(|n| n == name) {
            return Err(ExtError::AlreadyLoaded(name.to_string()));
        }

        let path = self.resolve_path(name)?;
        self.load_from_path(name, &path, registry)
    }

    /// Comme [`Self::load`] mais avec un chemin explicite, pour les tests et
    /// pour les appelants qui contournent la résolution par nom.
    pub fn load_from_path(
        &mut self,
        name: &str,
        path: &Path,
        registry: &mut NativeRegistry,
    ) -> ExtResult<Value> {
        // SAFETY: le chargement d'une bibliothèque dynamique est par nature
        // non vérifiable par le compilateur ; le contrat d'appelant est que
        // `path` désigne une extension Lattice compilée contre la même
        // version de `lattice-core`/`lattice-runtime` que l'hôte.
        let library = unsafe { Library::new(path) }
            .map_err(|e| ExtError::LoadFailed { path: path.display().to_string(), message: e.to_string() })?;

        // SAFETY: voir le commentaire ci-dessus ; `INIT_SYMBOL` est la seule
        // convention de nommage que cette fonction exige de l'extension.
        let init: Symbol<InitFn> = unsafe { library.get(INIT_SYMBOL) }
            .map_err(|_| ExtError::MissingInitSymbol)?;

        let mut ctx = RegistrationContext::new();
        // SAFETY: `init` provient d'un symbole résolu à l'instant et la
        // signature est garantie par la convention `INIT_SYMBOL`.
        unsafe { init(&mut ctx) };

        let module = format!("ext.{name}");
        let mut exports = OrderedMap::new();
        for (fn_name, func) in ctx.pending {
            let fqname: &'static str = Box::leak(format!("{module}.{fn_name}").into_boxed_str());
            let native_id = registry.register(&module, fqname, None, func);
            let closure = Closure {
                params: Vec::new(),
                defaults: Vec::new(),
                variadic: true,
                dispatch: Dispatch::Extension(ExtensionId(native_id.0)),
                upvalues: Vec::new(),
                param_phases: None,
                env: None,
                name: Some(lat_str(fqname)),
            };
            exports.insert(lat_str(&fn_name), Value::Closure(Arc::new(closure)));
        }

        self.libraries.push(library);
        self.loaded.push(name.to_string());
        Ok(Value::Map(exports))
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|n| n == name)
    }

    pub fn loaded_names(&self) -> &[String] {
        &self.loaded
    }
}
