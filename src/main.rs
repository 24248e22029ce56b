use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use storefront_sync::api::ProductsClient;
use storefront_sync::catalog::{self, ProductList, RenameProduct};
use storefront_sync::config::{self, Config};
use storefront_sync::logging;
use storefront_sync::store::{DurableStorage, MemoryStorage, SqliteStorage};
use storefront_sync::{CartItem, MutationCoordinator, QueryCache, QueryStatus, Theme, UiStore};

#[derive(Parser, Debug)]
#[command(name = "storefront-sync")]
#[command(about = "Cached product queries, optimistic edits and a persisted cart")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List products
  Products,
  /// Create a product
  AddProduct { name: String },
  /// Rename a product
  RenameProduct { id: u64, name: String },
  /// Delete a product
  DeleteProduct { id: u64 },
  /// Toggle between light and dark
  Theme,
  /// Cart actions
  #[command(subcommand)]
  Cart(CartCommand),
  /// Print the persisted store state as JSON
  State,
}

#[derive(Subcommand, Debug)]
enum CartCommand {
  Add { id: u64, name: String },
  List,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config::data_dir()?)?;

  match args.command {
    Command::Products => {
      let products = Catalog::new(&config)?;
      let list = products.load().await?;
      print_products(&list);
    }
    Command::AddProduct { name } => {
      let products = Catalog::new(&config)?;
      products.load().await?;
      let mutation = catalog::create_product(&products.client);
      let created = products.coordinator.mutate(&mutation, name).await?;
      println!("created {} {}", created.id, created.name);
      print_products(&products.load().await?);
    }
    Command::RenameProduct { id, name } => {
      let products = Catalog::new(&config)?;
      products.load().await?;
      let mutation = catalog::update_product(&products.client);
      let updated = products
        .coordinator
        .mutate(&mutation, RenameProduct { id, name })
        .await?;
      println!("renamed {} to {}", updated.id, updated.name);
      print_products(&products.load().await?);
    }
    Command::DeleteProduct { id } => {
      let products = Catalog::new(&config)?;
      products.load().await?;
      let mutation = catalog::delete_product(&products.client);
      let deleted = products.coordinator.mutate(&mutation, id).await?;
      println!("deleted {} {}", deleted.id, deleted.name);
      print_products(&products.load().await?);
    }
    Command::Theme => {
      let store = open_store(&config);
      let _hook = store.on_theme_change(apply_theme);
      store.toggle_theme()?;
    }
    Command::Cart(CartCommand::Add { id, name }) => {
      let store = open_store(&config);
      store.add_to_cart(CartItem::new(id, name))?;
      println!("cart: {} item(s)", store.get_state().cart_count());
    }
    Command::Cart(CartCommand::List) => {
      let store = open_store(&config);
      let state = store.get_state();
      for item in &state.cart {
        println!("{:>6}  {}", item.id, item.name);
      }
      println!("cart: {} item(s)", state.cart_count());
    }
    Command::State => {
      let store = open_store(&config);
      println!("{}", serde_json::to_string_pretty(&store.get_state())?);
    }
  }

  Ok(())
}

/// Products client, cache and coordinator sharing one cache.
struct Catalog {
  client: ProductsClient,
  coordinator: MutationCoordinator<ProductList>,
}

impl Catalog {
  fn new(config: &Config) -> Result<Self> {
    let client = ProductsClient::new(&config.api)?;
    let cache = QueryCache::new();
    cache.define(catalog::products_query(&client, &config.query));
    Ok(Self {
      client,
      coordinator: MutationCoordinator::new(cache),
    })
  }

  /// Read the product list, waiting out any fetch it triggers.
  async fn load(&self) -> Result<ProductList> {
    let cache = self.coordinator.cache();
    let key = catalog::products_key();
    cache.read(&key);
    cache.wait_settled(&key).await;

    let Some(entry) = cache.peek(&key) else {
      return Ok(Vec::new());
    };
    if entry.status == QueryStatus::Error {
      let message = entry
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string());
      return Err(eyre!("Failed to load products: {}", message));
    }
    Ok(entry.data().cloned().unwrap_or_default())
  }
}

fn print_products(products: &ProductList) {
  for product in products {
    println!("{:>14}  {}", product.id, product.name);
  }
  println!("{} product(s)", products.len());
}

fn open_store(config: &Config) -> UiStore {
  let storage: Arc<dyn DurableStorage> = match config
    .storage
    .resolved_path()
    .and_then(|path| SqliteStorage::open(&path))
  {
    Ok(storage) => Arc::new(storage),
    Err(e) => {
      warn!(error = %e, "durable storage unavailable, falling back to memory");
      Arc::new(MemoryStorage::new())
    }
  };
  UiStore::hydrated(storage, config.theme.system_preference)
}

fn apply_theme(theme: Theme) {
  match theme {
    Theme::Dark => println!("theme: dark (root marked 'dark')"),
    Theme::Light => println!("theme: light"),
  }
}
